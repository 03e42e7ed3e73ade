//! Simulated ESP32 client: streams LDR readings to the inference endpoint,
//! either as uniform random samples or replayed from a recorded CSV.

mod replay;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Largest raw value the 12-bit ADC can report.
const ADC_MAX: i64 = 4095;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct InferenceMsg<'a> {
    ldr: i64,
    device: &'a str,
    source: &'a str,
}

#[derive(Debug, Deserialize)]
struct InferenceReply {
    angle: Option<i64>,
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Random,
    Csv(PathBuf),
}

#[derive(Debug)]
struct SimConfig {
    server: String,
    mode: Mode,
    interval: Duration,
    count: Option<u64>,
    looped: bool,
    device: String,
    source: String,
}

impl SimConfig {
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = match lookup("SERVER_URL") {
            Some(s) if !s.trim().is_empty() => s,
            _ => bail!("SERVER_URL is required, e.g. http://127.0.0.1:5000/inference"),
        };

        let mode = match lookup("SIM_MODE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("random") => Mode::Random,
            Some("csv") => match lookup("SIM_CSV") {
                Some(p) if !p.trim().is_empty() => Mode::Csv(PathBuf::from(p)),
                _ => bail!("SIM_MODE=csv requires SIM_CSV"),
            },
            Some(other) => bail!("unknown SIM_MODE '{other}' (use random or csv)"),
        };

        let interval_s: f64 = match lookup("SIM_INTERVAL_S") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("SIM_INTERVAL_S is not a number: {v:?}"))?,
            None => 1.0,
        };
        if !interval_s.is_finite() || interval_s < 0.0 {
            bail!("SIM_INTERVAL_S must be a non-negative number, got {interval_s}");
        }

        let count = match lookup("SIM_COUNT") {
            Some(v) => match v.trim().parse::<u64>() {
                Ok(n) if n > 0 => Some(n),
                _ => bail!("SIM_COUNT is not a positive integer: {v:?}"),
            },
            None => None,
        };

        let looped = lookup("SIM_LOOP")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            server,
            mode,
            interval: Duration::from_secs_f64(interval_s),
            count,
            looped,
            device: lookup("SIM_DEVICE").unwrap_or_else(|| "sim".to_string()),
            source: lookup("SIM_SOURCE").unwrap_or_else(|| "simulator".to_string()),
        })
    }
}

struct Sender {
    http: reqwest::Client,
    cfg: SimConfig,
}

impl Sender {
    async fn send(&self, ldr: i64) -> Result<InferenceReply> {
        let msg = InferenceMsg {
            ldr,
            device: &self.cfg.device,
            source: &self.cfg.source,
        };
        let reply = self
            .http
            .post(&self.cfg.server)
            .json(&msg)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    /// Send one reading and log the outcome. Failures don't stop the stream.
    async fn send_logged(&self, ldr: i64) {
        match self.send(ldr).await {
            Ok(InferenceReply { angle, error: None }) => {
                info!(ldr, angle = ?angle, ok = true, "sent");
            }
            Ok(InferenceReply {
                angle,
                error: Some(e),
            }) => {
                warn!(ldr, angle = ?angle, ok = true, "sent; server fell back: {e}");
            }
            Err(e) => warn!(ldr, ok = false, "send failed: {e:#}"),
        }
    }

    async fn run_random(&self) {
        let mut sent: u64 = 0;
        loop {
            self.send_logged(fastrand::i64(0..=ADC_MAX)).await;
            sent += 1;
            if self.cfg.count.is_some_and(|c| sent >= c) {
                break;
            }
            sleep(self.cfg.interval).await;
        }
    }

    async fn run_replay(&self, values: &[i64]) {
        let mut idx = 0;
        loop {
            self.send_logged(values[idx]).await;
            idx += 1;
            if idx >= values.len() {
                if !self.cfg.looped {
                    break;
                }
                idx = 0;
            }
            sleep(self.cfg.interval).await;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = SimConfig::from_lookup(|k| env::var(k).ok())?;
    info!(server = %cfg.server, mode = ?cfg.mode, interval = ?cfg.interval, "simulator starting");

    let http = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build http client")?;

    let mode = cfg.mode.clone();
    let sender = Sender { http, cfg };

    match mode {
        Mode::Random => sender.run_random().await,
        Mode::Csv(path) => {
            let values = replay::load_values(&path)?;
            if values.is_empty() {
                bail!("replay CSV {} has no rows", path.display());
            }
            info!(rows = values.len(), "replaying CSV");
            sender.run_replay(&values).await;
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
