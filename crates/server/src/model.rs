//! Trained regression models: the `Predictor` seam and the JSON artifact
//! format produced by the offline training job.
//!
//! An artifact is either a bundle `{"model": ..., "features": [...]}` or a
//! bare predictor. Predictors are tagged by `kind`:
//!
//! ```text
//! {"kind": "linear", "coefficients": [...], "intercept": 0.0}
//! {"kind": "forest", "trees": [[{"feature": 0, "threshold": 1.5, "left": 1, "right": 2},
//!                               {"leaf": 10.0}, {"leaf": 20.0}]]}
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("X has {got} features, but model is expecting {expected} features as input")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("tree {tree} node {node}: feature index {feature} out of range for {width} inputs")]
    FeatureOutOfRange {
        tree: usize,
        node: usize,
        feature: usize,
        width: usize,
    },
    #[error("tree {tree}: node index {node} out of range")]
    NodeOutOfRange { tree: usize, node: usize },
    #[error("model produced a non-finite prediction ({0})")]
    NonFinite(f64),
    #[error("model returned no predictions")]
    EmptyOutput,
    #[error("model has no trees")]
    EmptyForest,
    #[error("prediction timed out after {0} ms")]
    TimedOut(u64),
    #[error("prediction worker failed: {0}")]
    Worker(String),
}

/// A trained regressor. `predict` returns one value per input row.
pub trait Predictor: Send + Sync {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError>;
}

// ---------------------------------------------------------------------------
// Linear regression
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl Predictor for LinearModel {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        rows.iter()
            .map(|row| {
                if row.len() != self.coefficients.len() {
                    return Err(ModelError::DimensionMismatch {
                        expected: self.coefficients.len(),
                        got: row.len(),
                    });
                }
                let y = self.intercept
                    + row
                        .iter()
                        .zip(&self.coefficients)
                        .map(|(x, w)| x * w)
                        .sum::<f64>();
                finite(y)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Regression forest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        leaf: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    pub trees: Vec<Vec<TreeNode>>,
}

impl ForestModel {
    fn eval_tree(&self, t: usize, row: &[f64]) -> Result<f64, ModelError> {
        let nodes = &self.trees[t];
        let mut idx = 0;
        // A well-formed tree reaches a leaf in at most `nodes.len()` steps.
        for _ in 0..=nodes.len() {
            let node = nodes
                .get(idx)
                .ok_or(ModelError::NodeOutOfRange { tree: t, node: idx })?;
            match node {
                TreeNode::Leaf { leaf } => return Ok(*leaf),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let x = row.get(*feature).ok_or(ModelError::FeatureOutOfRange {
                        tree: t,
                        node: idx,
                        feature: *feature,
                        width: row.len(),
                    })?;
                    idx = if *x <= *threshold { *left } else { *right };
                }
            }
        }
        Err(ModelError::NodeOutOfRange { tree: t, node: idx })
    }
}

impl Predictor for ForestModel {
    fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        if self.trees.is_empty() {
            return Err(ModelError::EmptyForest);
        }
        rows.iter()
            .map(|row| {
                let mut sum = 0.0;
                for t in 0..self.trees.len() {
                    sum += self.eval_tree(t, row)?;
                }
                finite(sum / self.trees.len() as f64)
            })
            .collect()
    }
}

fn finite(y: f64) -> Result<f64, ModelError> {
    if y.is_finite() {
        Ok(y)
    } else {
        Err(ModelError::NonFinite(y))
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelSpec {
    Linear(LinearModel),
    Forest(ForestModel),
}

impl ModelSpec {
    fn into_predictor(self) -> Arc<dyn Predictor> {
        match self {
            ModelSpec::Linear(m) => Arc::new(m),
            ModelSpec::Forest(m) => Arc::new(m),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelArtifact {
    Bundle {
        model: ModelSpec,
        #[serde(default)]
        features: Option<Vec<String>>,
    },
    Bare(ModelSpec),
}

/// A loaded predictor plus the ordered feature names it was trained on.
///
/// Without `features` the server cannot build an input row by name, so
/// every decision degrades to the fallback mapping. An empty list counts as
/// no list.
#[derive(Clone)]
pub struct ModelBundle {
    pub predictor: Arc<dyn Predictor>,
    pub features: Option<Vec<String>>,
}

impl fmt::Debug for ModelBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBundle")
            .field("predictor", &"<dyn Predictor>")
            .field("features", &self.features)
            .finish()
    }
}

impl ModelBundle {
    pub fn new(predictor: Arc<dyn Predictor>, features: Option<Vec<String>>) -> Self {
        Self {
            predictor,
            features: features.filter(|names| !names.is_empty()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let artifact: ModelArtifact =
            serde_json::from_str(json).context("unrecognised model artifact")?;
        Ok(match artifact {
            ModelArtifact::Bundle { model, features } => Self::new(model.into_predictor(), features),
            ModelArtifact::Bare(model) => Self::new(model.into_predictor(), None),
        })
    }
}

/// Load the model artifact at `path`. A missing file is not an error: the
/// server then runs on the fallback mapping alone.
pub fn load(path: &Path) -> Result<Option<ModelBundle>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model: {}", path.display()))?;
    let bundle = ModelBundle::from_json(&contents)
        .with_context(|| format!("failed to parse model: {}", path.display()))?;
    Ok(Some(bundle))
}

// ===========================================================================
// Tests
// ===========================================================================
