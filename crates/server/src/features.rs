//! Streaming features derived from a device window and the wall clock.

use serde::Serialize;
use std::f64::consts::PI;
use time::{OffsetDateTime, UtcOffset};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Feature names in the order the vector exposes them.
pub const FEATURE_NAMES: [&str; 7] = [
    "ldr",
    "ldr_ma3",
    "ldr_ma5",
    "ldr_ma15",
    "ldr_delta1",
    "tod_sin",
    "tod_cos",
];

/// Whether a model-declared feature name is one this server computes.
pub fn is_known(name: &str) -> bool {
    FEATURE_NAMES.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureVector {
    pub ldr: f64,
    pub ldr_ma3: f64,
    pub ldr_ma5: f64,
    pub ldr_ma15: f64,
    pub ldr_delta1: f64,
    pub tod_sin: f64,
    pub tod_cos: f64,
}

impl FeatureVector {
    /// Look up a feature by the name a trained model declares for it.
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "ldr" => Some(self.ldr),
            "ldr_ma3" => Some(self.ldr_ma3),
            "ldr_ma5" => Some(self.ldr_ma5),
            "ldr_ma15" => Some(self.ldr_ma15),
            "ldr_delta1" => Some(self.ldr_delta1),
            "tod_sin" => Some(self.tod_sin),
            "tod_cos" => Some(self.tod_cos),
            _ => None,
        }
    }

    /// Build a model input row; names the vector doesn't know become 0.0.
    pub fn select(&self, names: &[String]) -> Vec<f64> {
        names.iter().map(|n| self.get(n).unwrap_or(0.0)).collect()
    }
}

/// Compute the feature vector for `window` (oldest first) at time `now`.
///
/// Moving averages use however many samples are available, so a device's
/// very first reading yields ma3 = ma5 = ma15 = ldr and a zero delta.
pub fn compute(window: &[f64], now: OffsetDateTime) -> FeatureVector {
    let ldr = window.last().copied().unwrap_or(0.0);
    let ldr_delta1 = match window {
        [.., prev, last] => last - prev,
        _ => 0.0,
    };
    let (tod_sin, tod_cos) = time_of_day(now);

    FeatureVector {
        ldr,
        ldr_ma3: trailing_mean(window, 3),
        ldr_ma5: trailing_mean(window, 5),
        ldr_ma15: trailing_mean(window, 15),
        ldr_delta1,
        tod_sin,
        tod_cos,
    }
}

/// Mean of the last `n` values, or of all of them if fewer exist.
fn trailing_mean(window: &[f64], n: usize) -> f64 {
    let tail = &window[window.len().saturating_sub(n)..];
    if tail.is_empty() {
        return 0.0;
    }
    tail.iter().sum::<f64>() / tail.len() as f64
}

/// Cyclic (sin, cos) encoding of the UTC time of day.
fn time_of_day(now: OffsetDateTime) -> (f64, f64) {
    let utc = now.to_offset(UtcOffset::UTC);
    let seconds =
        utc.hour() as f64 * 3600.0 + utc.minute() as f64 * 60.0 + utc.second() as f64;
    let angle = 2.0 * PI * seconds / SECONDS_PER_DAY;
    (angle.sin(), angle.cos())
}

// ===========================================================================
// Tests
// ===========================================================================
