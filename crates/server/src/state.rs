use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::decider::{Decision, Reading};
use crate::model::ModelBundle;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub model: ModelSummary,
    pub devices: HashMap<String, DeviceState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct ModelSummary {
    pub loaded: bool,
    pub features: Option<Vec<String>>,
}

#[derive(Clone, Serialize)]
pub struct DeviceState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub last_ldr: f64,
    pub last_angle: u8,
    pub last_source: String,
    pub readings: u64,
    /// Current feature window, filled in when a snapshot is served.
    pub window: Vec<f64>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Decision,
    Fallback,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub model: ModelSummary,
    pub devices: HashMap<String, DeviceState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(model: Option<&ModelBundle>) -> Self {
        Self {
            started_at: Instant::now(),
            model: ModelSummary {
                loaded: model.is_some(),
                features: model.and_then(|m| m.features.clone()),
            },
            devices: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record the outcome of one inference request.
    pub fn record_decision(&mut self, reading: &Reading, decision: &Decision) {
        let now = OffsetDateTime::now_utc();

        let dev = self
            .devices
            .entry(reading.device.clone())
            .or_insert_with(|| DeviceState {
                last_seen: now,
                last_ldr: reading.ldr,
                last_angle: decision.angle,
                last_source: decision.source.clone(),
                readings: 0,
                window: Vec::new(),
            });
        dev.last_seen = now;
        dev.last_ldr = reading.ldr;
        dev.last_angle = decision.angle;
        dev.last_source = decision.source.clone();
        dev.readings += 1;

        let mut detail = format!(
            "{}: ldr={} -> angle={} ({})",
            reading.device, reading.ldr, decision.angle, decision.source
        );
        let kind = match &decision.error {
            Some(e) => {
                detail.push_str(&format!(" model error: {e}"));
                EventKind::Fallback
            }
            None => EventKind::Decision,
        };
        self.push_event(kind, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            model: self.model.clone(),
            devices: self.devices.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
