//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Largest accepted `model.timeout_ms`.
const MAX_MODEL_TIMEOUT_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub path: String,
    pub default_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "model.json".into(),
            timeout_ms: 250,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: "logs.csv".into(),
            default_limit: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host is empty".into());
        }
        if self.server.port == 0 {
            errors.push("server.port must be non-zero".into());
        }

        if self.model.path.trim().is_empty() {
            errors.push("model.path is empty".into());
        }
        if self.model.timeout_ms == 0 || self.model.timeout_ms > MAX_MODEL_TIMEOUT_MS {
            errors.push(format!(
                "model.timeout_ms {} out of range [1, {MAX_MODEL_TIMEOUT_MS}]",
                self.model.timeout_ms
            ));
        }

        if self.log.path.trim().is_empty() {
            errors.push("log.path is empty".into());
        }
        if self.log.default_limit == 0 {
            errors.push("log.default_limit must be positive".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Apply `WEB_HOST`, `WEB_PORT`, `MODEL_PATH`, `MODEL_TIMEOUT_MS` and
    /// `LOG_FILE` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WEB_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("WEB_PORT") {
            self.server.port = v
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT is not a valid port: {v:?}"))?;
        }
        if let Some(v) = lookup("MODEL_PATH") {
            self.model.path = v;
        }
        if let Some(v) = lookup("MODEL_TIMEOUT_MS") {
            self.model.timeout_ms = v
                .trim()
                .parse()
                .with_context(|| format!("MODEL_TIMEOUT_MS is not a number: {v:?}"))?;
        }
        if let Some(v) = lookup("LOG_FILE") {
            self.log.path = v;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file (no validation).
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Resolve the process configuration: file (from `CONFIG_PATH`, or
/// `config.toml` if present), then environment overrides, then validation.
pub fn resolve<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match lookup("CONFIG_PATH") {
        Some(path) => load(&path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load(DEFAULT_CONFIG_PATH)?,
        None => Config::default(),
    };
    config.apply_env(&lookup)?;
    config.validate().context("invalid config")?;
    Ok(config)
}

pub fn from_env() -> Result<Config> {
    resolve(|key| std::env::var(key).ok())
}

// ===========================================================================
// Tests
// ===========================================================================
