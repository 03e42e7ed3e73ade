//! Append-only CSV log of every angle decision, kept for retraining.
//!
//! One process-wide lock serialises appends, resets, and reads, so rows are
//! never interleaved and a reader always sees whole rows.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub const HEADER: [&str; 5] = ["timestamp", "device", "ldr", "angle", "source"];

/// One logged decision. Field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// ISO-8601 UTC.
    pub timestamp: String,
    pub device: String,
    pub ldr: i64,
    pub angle: u8,
    pub source: String,
}

pub struct DecisionLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DecisionLog {
    /// Open the log at `path`, writing the header row if the file is new or
    /// empty. Existing rows are kept.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create log dir: {}", dir.display()))?;
        }

        let log = Self {
            path,
            lock: Mutex::new(()),
        };
        {
            let _guard = log.lock.lock().await;
            if log.is_missing_or_empty().await {
                log.write_header().await?;
            }
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and sync it to disk before returning.
    pub async fn append(&self, record: &DecisionRecord) -> Result<()> {
        let mut w = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        w.serialize(record).context("failed to encode decision row")?;
        let row = w.into_inner().context("failed to encode decision row")?;

        let _guard = self.lock.lock().await;
        // The file may have been removed out from under us; start it over.
        if self.is_missing_or_empty().await {
            self.write_header().await?;
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open log: {}", self.path.display()))?;
        file.write_all(&row)
            .await
            .with_context(|| format!("failed to append to log: {}", self.path.display()))?;
        file.flush().await?;
        file.sync_data()
            .await
            .with_context(|| format!("failed to sync log: {}", self.path.display()))?;
        Ok(())
    }

    /// The most recent `limit` rows, oldest first. Rows that fail to parse
    /// are skipped.
    pub async fn read_recent(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let bytes = {
            let _guard = self.lock.lock().await;
            match fs::read(&self.path).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to read log: {}", self.path.display()))
                }
            }
        };

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes.as_slice());

        let mut rows = Vec::new();
        for (i, rec) in rdr.deserialize::<DecisionRecord>().enumerate() {
            match rec {
                Ok(r) => rows.push(r),
                Err(e) => warn!(row = i + 1, "decision log: skipping bad row: {e}"),
            }
        }

        let start = rows.len().saturating_sub(limit);
        Ok(rows.split_off(start))
    }

    /// Truncate the log back to just the header row.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_header().await
    }

    async fn is_missing_or_empty(&self) -> bool {
        match fs::metadata(&self.path).await {
            Ok(m) => m.len() == 0,
            Err(_) => true,
        }
    }

    // Caller holds `lock`.
    async fn write_header(&self) -> Result<()> {
        let mut w = csv::Writer::from_writer(Vec::new());
        w.write_record(HEADER).context("failed to encode log header")?;
        let header = w.into_inner().context("failed to encode log header")?;

        let mut file = fs::File::create(&self.path)
            .await
            .with_context(|| format!("failed to create log: {}", self.path.display()))?;
        file.write_all(&header).await?;
        file.sync_data()
            .await
            .with_context(|| format!("failed to sync log: {}", self.path.display()))?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
