mod config;
mod decider;
mod decision_log;
mod features;
mod model;
mod state;
mod web;
mod window;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use decider::Decider;
use decision_log::DecisionLog;
use state::SystemState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let cfg = config::from_env()?;
    info!(
        host = %cfg.server.host,
        port = cfg.server.port,
        model = %cfg.model.path,
        timeout_ms = cfg.model.timeout_ms,
        log = %cfg.log.path,
        "config loaded"
    );

    // ── Decision log ────────────────────────────────────────────────
    let log = Arc::new(DecisionLog::open(&cfg.log.path).await?);
    info!(path = %log.path().display(), "decision log ready");

    // ── Model (optional) ────────────────────────────────────────────
    let model = model::load(Path::new(&cfg.model.path))?;
    match &model {
        Some(m) => match &m.features {
            Some(names) => {
                info!(features = ?names, "model loaded");
                for name in names.iter().filter(|n| !features::is_known(n)) {
                    warn!(feature = %name, "model expects a feature this server does not compute; it will be 0.0");
                }
            }
            None => warn!("model loaded without a (non-empty) feature list; every request will use the fallback mapping"),
        },
        None => warn!(path = %cfg.model.path, "model not found; running with fallback mapping"),
    }

    // ── Shared state (ephemeral, for the status API) ────────────────
    let status = Arc::new(RwLock::new(SystemState::new(model.as_ref())));
    status
        .write()
        .await
        .record_system("server started".to_string());

    let decider = Arc::new(Decider::new(
        model,
        Duration::from_millis(cfg.model.timeout_ms),
        Arc::clone(&log),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        decider,
        log,
        status,
        default_limit: cfg.log.default_limit,
    };
    web::serve(app, &cfg.server.host, cfg.server.port).await
}
