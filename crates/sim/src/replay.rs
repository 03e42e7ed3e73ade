//! CSV replay source: pulls the LDR column out of a recorded dataset.

use anyhow::{anyhow, bail, Context, Result};
use csv::StringRecord;
use std::io::Read;
use std::path::Path;

/// Column names tried, in order, before falling back to the first numeric
/// column.
const PREFERRED_COLUMNS: [&str; 3] = ["ldr", "ldr_value", "value"];

/// Load every LDR value from the CSV at `path`.
pub fn load_values(path: &Path) -> Result<Vec<i64>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open replay CSV: {}", path.display()))?;
    read_values(file).with_context(|| format!("failed to read replay CSV: {}", path.display()))
}

pub fn read_values<R: Read>(reader: R) -> Result<Vec<i64>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);

    let headers = rdr.headers().context("missing CSV header")?.clone();
    let records = rdr
        .records()
        .collect::<Result<Vec<StringRecord>, _>>()
        .context("malformed CSV row")?;

    let col = pick_column(&headers, &records)
        .ok_or_else(|| anyhow!("no numeric column for LDR found in CSV"))?;

    records
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let cell = r.get(col).unwrap_or("").trim();
            match cell.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(v.trunc() as i64),
                _ => bail!("row {}: {:?} in column '{}' is not a number", i + 1, cell, &headers[col]),
            }
        })
        .collect()
}

fn pick_column(headers: &StringRecord, records: &[StringRecord]) -> Option<usize> {
    for name in PREFERRED_COLUMNS {
        if let Some(i) = headers.iter().position(|h| h.trim() == name) {
            return Some(i);
        }
    }

    if records.is_empty() {
        return None;
    }
    (0..headers.len()).find(|&i| {
        records
            .iter()
            .all(|r| r.get(i).is_some_and(|c| c.trim().parse::<f64>().is_ok()))
    })
}

// ===========================================================================
// Tests
// ===========================================================================
