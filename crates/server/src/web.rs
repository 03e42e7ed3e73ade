use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::decider::{Decider, Reading};
use crate::decision_log::{DecisionLog, DecisionRecord};
use crate::state::SharedState;

const INDEX_HTML: &str = include_str!("ui/index.html");

const DEFAULT_DEVICE: &str = "sim";
const DEFAULT_SOURCE: &str = "simulator";

#[derive(Clone)]
pub struct AppState {
    pub decider: Arc<Decider>,
    pub log: Arc<DecisionLog>,
    pub status: SharedState,
    pub default_limit: usize,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InferenceRequest {
    #[serde(default)]
    ldr: f64,
    #[serde(default = "default_device")]
    device: String,
    #[serde(default = "default_source")]
    source: String,
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_source() -> String {
    DEFAULT_SOURCE.to_string()
}

#[derive(Debug, Serialize)]
struct InferenceResponse {
    angle: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DataParams {
    limit: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct DataResponse {
    timestamps: Vec<String>,
    ldr: Vec<i64>,
    angle: Vec<u8>,
}

impl From<Vec<DecisionRecord>> for DataResponse {
    fn from(rows: Vec<DecisionRecord>) -> Self {
        let mut out = DataResponse::default();
        for r in rows {
            out.timestamps.push(r.timestamp);
            out.ldr.push(r.ldr);
            out.angle.push(r.angle);
        }
        out
    }
}

/// Parse an inference body. Content-Type is not checked; anything that is
/// not a JSON object with the expected field types is rejected.
pub(crate) fn parse_reading(body: &[u8]) -> Result<Reading, String> {
    let req: InferenceRequest =
        serde_json::from_slice(body).map_err(|e| format!("invalid json: {e}"))?;

    if !req.ldr.is_finite() {
        return Err("ldr must be a finite number".into());
    }
    if req.device.trim().is_empty() {
        return Err("device must be a non-empty string".into());
    }

    Ok(Reading {
        device: req.device,
        ldr: req.ldr,
        source: req.source,
    })
}

fn error_response(status: StatusCode, msg: String) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/inference", post(inference))
        .route("/data", get(data))
        .route("/clear_logs", post(clear_logs))
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn inference(State(app): State<AppState>, body: Bytes) -> Response {
    let reading = match parse_reading(&body) {
        Ok(r) => r,
        Err(msg) => {
            warn!("rejected inference request: {msg}");
            app.status
                .write()
                .await
                .record_error(format!("bad request: {msg}"));
            return error_response(StatusCode::BAD_REQUEST, msg);
        }
    };

    let decision = app.decider.decide(&reading).await;
    app.status
        .write()
        .await
        .record_decision(&reading, &decision);

    Json(InferenceResponse {
        angle: decision.angle,
        error: decision.error,
    })
    .into_response()
}

async fn data(State(app): State<AppState>, Query(params): Query<DataParams>) -> Response {
    let limit = match params.limit.as_deref().map(str::trim) {
        None | Some("") => app.default_limit,
        Some(s) => match s.parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("limit must be a non-negative integer, got {s:?}"),
                )
            }
        },
    };

    match app.log.read_recent(limit).await {
        Ok(rows) => Json(DataResponse::from(rows)).into_response(),
        Err(e) => {
            error!("reading decision log failed: {e:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

async fn clear_logs(State(app): State<AppState>) -> Response {
    match app.log.reset().await {
        Ok(()) => {
            info!("decision log cleared");
            app.status
                .write()
                .await
                .record_system("logs cleared".to_string());
            Json(json!({ "ok": true, "msg": "logs cleared" })).into_response()
        }
        Err(e) => {
            error!("clearing decision log failed: {e:#}");
            app.status
                .write()
                .await
                .record_error(format!("clear logs failed: {e:#}"));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": format!("{e:#}") })),
            )
                .into_response()
        }
    }
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let mut status = app.status.read().await.to_status();
    for (device, dev) in status.devices.iter_mut() {
        dev.window = app.decider.windows().snapshot(device).unwrap_or_default();
    }
    Json(status)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind web port {host}:{port}"))?;
    let addr = listener.local_addr()?;

    info!("listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
