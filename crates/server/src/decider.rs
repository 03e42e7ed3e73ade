//! Reading → angle decisions.
//!
//! Each reading is pushed into its device window, turned into features, and
//! handed to the trained model when one is configured. Anything that keeps
//! the model from producing a usable number (no model, no feature list, an
//! error, a timeout, a panic) resolves to the linear fallback mapping, so the
//! actuator always gets an angle. Every decision is appended to the log.

use std::sync::Arc;
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::decision_log::{DecisionLog, DecisionRecord};
use crate::features::{self, FeatureVector};
use crate::model::{ModelBundle, ModelError};
use crate::window::WindowStore;

/// Full-scale value of the 12-bit ADC the LDR is sampled with.
pub const ADC_MAX: f64 = 4095.0;
pub const ANGLE_MAX: u8 = 180;
pub const FALLBACK_SOURCE: &str = "fallback";

/// One inbound sensor sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device: String,
    pub ldr: f64,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub angle: u8,
    /// The caller's `source` on the model path, `"fallback"` otherwise.
    pub source: String,
    /// Set only when the model was tried and failed.
    pub error: Option<String>,
}

/// What became of the attempt to ask the model.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictOutcome {
    Predicted(f64),
    Failed(String),
    Unavailable,
}

pub struct Decider {
    windows: WindowStore,
    model: Option<ModelBundle>,
    timeout: Duration,
    log: Arc<DecisionLog>,
}

impl Decider {
    pub fn new(model: Option<ModelBundle>, timeout: Duration, log: Arc<DecisionLog>) -> Self {
        Self {
            windows: WindowStore::new(),
            model,
            timeout,
            log,
        }
    }

    pub fn windows(&self) -> &WindowStore {
        &self.windows
    }

    pub async fn decide(&self, reading: &Reading) -> Decision {
        self.decide_at(reading, OffsetDateTime::now_utc()).await
    }

    pub async fn decide_at(&self, reading: &Reading, now: OffsetDateTime) -> Decision {
        let window = self.windows.record(&reading.device, reading.ldr);
        let feats = features::compute(&window, now);

        let outcome = self.predict(&feats).await;
        let decision = resolve(outcome, reading);

        match &decision.error {
            Some(e) => warn!(
                device = %reading.device,
                ldr = reading.ldr,
                angle = decision.angle,
                "model failed, using fallback: {e}"
            ),
            None => debug!(
                device = %reading.device,
                ldr = reading.ldr,
                angle = decision.angle,
                source = %decision.source,
                "decision"
            ),
        }

        let record = DecisionRecord {
            timestamp: now.format(&Rfc3339).unwrap_or_else(|_| now.to_string()),
            device: reading.device.clone(),
            ldr: reading.ldr.trunc() as i64,
            angle: decision.angle,
            source: decision.source.clone(),
        };
        if let Err(e) = self.log.append(&record).await {
            error!(device = %reading.device, "decision log append failed: {e:#}");
        }

        decision
    }

    async fn predict(&self, feats: &FeatureVector) -> PredictOutcome {
        let Some(bundle) = &self.model else {
            return PredictOutcome::Unavailable;
        };
        let names = match &bundle.features {
            Some(names) if !names.is_empty() => names,
            _ => return PredictOutcome::Unavailable,
        };

        let row = feats.select(names);
        let predictor = Arc::clone(&bundle.predictor);
        let task = tokio::task::spawn_blocking(move || predictor.predict(&[row]));

        let result = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(ModelError::TimedOut(self.timeout.as_millis() as u64)),
            Ok(Err(join)) => Err(ModelError::Worker(join.to_string())),
            Ok(Ok(r)) => r,
        };

        match result {
            Ok(preds) => match preds.first() {
                Some(y) if y.is_finite() => PredictOutcome::Predicted(*y),
                Some(y) => PredictOutcome::Failed(ModelError::NonFinite(*y).to_string()),
                None => PredictOutcome::Failed(ModelError::EmptyOutput.to_string()),
            },
            Err(e) => PredictOutcome::Failed(e.to_string()),
        }
    }
}

/// Turn a prediction outcome into an angle. Never fails.
pub fn resolve(outcome: PredictOutcome, reading: &Reading) -> Decision {
    match outcome {
        PredictOutcome::Predicted(y) => Decision {
            angle: clamp_angle(y),
            source: reading.source.clone(),
            error: None,
        },
        PredictOutcome::Failed(reason) => Decision {
            angle: fallback_angle(reading.ldr),
            source: FALLBACK_SOURCE.to_string(),
            error: Some(reason),
        },
        PredictOutcome::Unavailable => Decision {
            angle: fallback_angle(reading.ldr),
            source: FALLBACK_SOURCE.to_string(),
            error: None,
        },
    }
}

/// Linear inverse mapping: dark (0) → 180°, bright (4095) → 0°.
pub fn fallback_angle(ldr: f64) -> u8 {
    clamp_angle((ADC_MAX - ldr) * f64::from(ANGLE_MAX) / ADC_MAX)
}

/// Round half to even and clamp into `[0, 180]`.
pub fn clamp_angle(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round_ties_even().clamp(0.0, f64::from(ANGLE_MAX)) as u8
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinearModel, Predictor};
    use time::macros::datetime;

    const NOON: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    struct Fixed(f64);
    impl Predictor for Fixed {
        fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
            Ok(vec![self.0; rows.len()])
        }
    }

    struct Failing;
    impl Predictor for Failing {
        fn predict(&self, _rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
            Err(ModelError::DimensionMismatch {
                expected: 2,
                got: 1,
            })
        }
    }

    struct Panicking;
    impl Predictor for Panicking {
        fn predict(&self, _rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
            panic!("model exploded")
        }
    }

    struct Slow;
    impl Predictor for Slow {
        fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(vec![10.0; rows.len()])
        }
    }

    /// Echoes the row so tests can see exactly what the model was given.
    struct Echo;
    impl Predictor for Echo {
        fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
            Ok(rows.iter().map(|r| r.iter().sum()).collect())
        }
    }

    fn reading(device: &str, ldr: f64) -> Reading {
        Reading {
            device: device.into(),
            ldr,
            source: "simulator".into(),
        }
    }

    fn names(list: &[&str]) -> Option<Vec<String>> {
        Some(list.iter().map(|s| s.to_string()).collect())
    }

    async fn decider_with(
        model: Option<ModelBundle>,
        timeout_ms: u64,
    ) -> (Decider, Arc<DecisionLog>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(DecisionLog::open(dir.path().join("logs.csv")).await.unwrap());
        let d = Decider::new(model, Duration::from_millis(timeout_ms), Arc::clone(&log));
        (d, log, dir)
    }

    fn bundle(p: impl Predictor + 'static, features: Option<Vec<String>>) -> Option<ModelBundle> {
        Some(ModelBundle::new(Arc::new(p), features))
    }

    // -- Fallback formula ---------------------------------------------------

    #[test]
    fn fallback_endpoints() {
        assert_eq!(fallback_angle(0.0), 180);
        assert_eq!(fallback_angle(4095.0), 0);
        assert_eq!(fallback_angle(2047.5), 90);
    }

    #[test]
    fn fallback_matches_formula_over_adc_range() {
        for ldr in 0..=4095 {
            let expected = ((4095.0 - ldr as f64) * 180.0 / 4095.0).round();
            assert_eq!(fallback_angle(ldr as f64) as f64, expected, "ldr={ldr}");
        }
    }

    #[test]
    fn fallback_clamps_out_of_range_input() {
        assert_eq!(fallback_angle(-500.0), 180);
        assert_eq!(fallback_angle(10_000.0), 0);
    }

    #[test]
    fn clamp_angle_bounds_and_rounding() {
        assert_eq!(clamp_angle(90.6), 91);
        assert_eq!(clamp_angle(90.4), 90);
        assert_eq!(clamp_angle(90.5), 90);
        assert_eq!(clamp_angle(91.5), 92);
        assert_eq!(clamp_angle(-3.0), 0);
        assert_eq!(clamp_angle(999.0), 180);
        assert_eq!(clamp_angle(f64::NAN), 0);
        assert_eq!(clamp_angle(f64::INFINITY), 180);
    }

    // -- resolve ------------------------------------------------------------

    #[test]
    fn resolve_predicted_keeps_caller_source() {
        let d = resolve(PredictOutcome::Predicted(250.0), &reading("d", 0.0));
        assert_eq!(d.angle, 180);
        assert_eq!(d.source, "simulator");
        assert_eq!(d.error, None);
    }

    #[test]
    fn resolve_failed_uses_fallback_and_reports() {
        let d = resolve(PredictOutcome::Failed("boom".into()), &reading("d", 4095.0));
        assert_eq!(d.angle, 0);
        assert_eq!(d.source, FALLBACK_SOURCE);
        assert_eq!(d.error.as_deref(), Some("boom"));
    }

    #[test]
    fn resolve_unavailable_is_silent_fallback() {
        let d = resolve(PredictOutcome::Unavailable, &reading("d", 0.0));
        assert_eq!(d.angle, 180);
        assert_eq!(d.source, FALLBACK_SOURCE);
        assert_eq!(d.error, None);
    }

    // -- End to end ---------------------------------------------------------

    #[tokio::test]
    async fn no_model_sequence_follows_fallback_formula_and_logs_each() {
        let (d, log, _dir) = decider_with(None, 250).await;
        let mut angles = Vec::new();
        for ldr in [100.0, 200.0, 300.0] {
            let out = d.decide_at(&reading("d1", ldr), NOON).await;
            assert_eq!(out.source, FALLBACK_SOURCE);
            assert_eq!(out.error, None);
            angles.push(out.angle);
        }
        assert_eq!(angles, vec![176, 171, 167]);

        let rows = log.read_recent(10).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.source == FALLBACK_SOURCE && r.device == "d1"));
        assert_eq!(rows[0].ldr, 100);
        assert_eq!(rows[0].timestamp, "2024-06-01T12:00:00Z");
    }

    #[tokio::test]
    async fn fixed_prediction_is_rounded_regardless_of_window() {
        let (d, log, _dir) = decider_with(bundle(Fixed(90.6), names(&["ldr"])), 250).await;
        for ldr in [0.0, 4095.0, 1234.0] {
            let out = d.decide_at(&reading("d1", ldr), NOON).await;
            assert_eq!(out.angle, 91);
            assert_eq!(out.source, "simulator");
            assert_eq!(out.error, None);
        }
        let rows = log.read_recent(10).await.unwrap();
        assert!(rows.iter().all(|r| r.angle == 91 && r.source == "simulator"));
    }

    #[tokio::test]
    async fn model_row_follows_declared_feature_order() {
        // ldr_ma3 after [10, 20] is 15, ldr_delta1 is 10, unknown is 0.
        let (d, _log, _dir) =
            decider_with(bundle(Echo, names(&["ldr_ma3", "ldr_delta1", "unknown"])), 250).await;
        d.decide_at(&reading("d1", 10.0), NOON).await;
        let out = d.decide_at(&reading("d1", 20.0), NOON).await;
        assert_eq!(out.angle, 25);
    }

    #[tokio::test]
    async fn model_error_falls_back_with_message() {
        let (d, log, _dir) = decider_with(bundle(Failing, names(&["ldr"])), 250).await;
        let out = d.decide_at(&reading("d1", 0.0), NOON).await;
        assert_eq!(out.angle, 180);
        assert_eq!(out.source, FALLBACK_SOURCE);
        assert!(out.error.unwrap().contains("expecting 2 features"));
        assert_eq!(log.read_recent(10).await.unwrap()[0].source, FALLBACK_SOURCE);
    }

    #[tokio::test]
    async fn real_model_dimension_mismatch_falls_back() {
        let linear = LinearModel {
            coefficients: vec![1.0, 1.0],
            intercept: 0.0,
        };
        let (d, _log, _dir) = decider_with(bundle(linear, names(&["ldr"])), 250).await;
        let out = d.decide_at(&reading("d1", 4095.0), NOON).await;
        assert_eq!(out.angle, 0);
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn model_panic_falls_back() {
        let (d, _log, _dir) = decider_with(bundle(Panicking, names(&["ldr"])), 250).await;
        let out = d.decide_at(&reading("d1", 0.0), NOON).await;
        assert_eq!(out.angle, 180);
        assert!(out.error.unwrap().starts_with("prediction worker failed"));
    }

    #[tokio::test]
    async fn slow_model_times_out_to_fallback() {
        let (d, _log, _dir) = decider_with(bundle(Slow, names(&["ldr"])), 20).await;
        let out = d.decide_at(&reading("d1", 4095.0), NOON).await;
        assert_eq!(out.angle, 0);
        assert_eq!(out.source, FALLBACK_SOURCE);
        assert_eq!(out.error.as_deref(), Some("prediction timed out after 20 ms"));
    }

    #[tokio::test]
    async fn non_finite_prediction_falls_back() {
        let (d, _log, _dir) = decider_with(bundle(Fixed(f64::NAN), names(&["ldr"])), 250).await;
        let out = d.decide_at(&reading("d1", 0.0), NOON).await;
        assert_eq!(out.angle, 180);
        assert!(out.error.unwrap().contains("non-finite"));
    }

    #[tokio::test]
    async fn model_without_feature_list_is_silent_fallback() {
        let (d, _log, _dir) = decider_with(bundle(Fixed(10.0), None), 250).await;
        let out = d.decide_at(&reading("d1", 0.0), NOON).await;
        assert_eq!(out.angle, 180);
        assert_eq!(out.source, FALLBACK_SOURCE);
        assert_eq!(out.error, None);
    }

    #[tokio::test]
    async fn empty_feature_list_is_silent_fallback() {
        let one_coef = LinearModel {
            coefficients: vec![1.0],
            intercept: 0.0,
        };
        let no_coef = LinearModel {
            coefficients: vec![],
            intercept: 42.0,
        };
        for model in [one_coef, no_coef] {
            let (d, log, _dir) = decider_with(bundle(model, Some(Vec::new())), 250).await;
            let out = d.decide_at(&reading("d1", 0.0), NOON).await;
            assert_eq!(out.angle, 180);
            assert_eq!(out.source, FALLBACK_SOURCE);
            assert_eq!(out.error, None);
            assert_eq!(log.read_recent(1).await.unwrap()[0].source, FALLBACK_SOURCE);
        }
    }

    #[tokio::test]
    async fn empty_feature_list_in_artifact_is_silent_fallback() {
        let b = ModelBundle::from_json(
            r#"{"model": {"kind": "linear", "coefficients": [], "intercept": 42.0}, "features": []}"#,
        )
        .unwrap();
        let (d, _log, _dir) = decider_with(Some(b), 250).await;
        let out = d.decide_at(&reading("d1", 4095.0), NOON).await;
        assert_eq!(out.angle, 0);
        assert_eq!(out.source, FALLBACK_SOURCE);
        assert_eq!(out.error, None);
    }

    #[tokio::test]
    async fn every_decision_mutates_window() {
        let (d, _log, _dir) = decider_with(None, 250).await;
        for i in 0..20 {
            d.decide_at(&reading("d1", i as f64), NOON).await;
        }
        let w = d.windows().snapshot("d1").unwrap();
        assert_eq!(w.len(), crate::window::WINDOW_SIZE);
        assert_eq!(w.last(), Some(&19.0));
    }
}
