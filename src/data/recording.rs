//! Delimited recording and calibration files.
//!
//! Both formats are a header row followed by two numeric columns:
//!
//! | file        | header              | rows                       |
//! |-------------|---------------------|----------------------------|
//! | recording   | `time,raw reading`  | grid time, averaged value  |
//! | calibration | `measured,real`     | raw value, Newtons         |
//!
//! Loading is best-effort: rows that do not hold exactly two numbers are
//! skipped with a warning and the rest of the file is still used. The header
//! is optional; a non-numeric first row is treated as one.
//!
//! Requires the `storage_csv` feature; without it every call returns
//! [`DaqError::FeatureNotEnabled`].

use super::series::SeriesPoint;
#[cfg(not(feature = "storage_csv"))]
use crate::error::DaqError;
use crate::error::AppResult;
use std::path::Path;

/// Header row of a recording file.
pub const RECORDING_HEADER: [&str; 2] = ["time", "raw reading"];

/// Header row of a calibration file.
pub const CALIBRATION_HEADER: [&str; 2] = ["measured", "real"];

/// Write series points as a recording. Nothing is created for an empty slice.
///
/// Returns the number of rows written.
pub fn save_recording(path: impl AsRef<Path>, points: &[SeriesPoint]) -> AppResult<usize> {
    let rows: Vec<(f64, f64)> = points.iter().map(|p| (p.time, p.value)).collect();
    write_pairs(path.as_ref(), RECORDING_HEADER, &rows)
}

/// Read `(time, value)` rows from a recording.
pub fn load_recording(path: impl AsRef<Path>) -> AppResult<Vec<(f64, f64)>> {
    read_pairs(path.as_ref())
}

/// Write `(measured, real in Newtons)` pairs. Nothing is created for an empty slice.
pub fn save_calibration(path: impl AsRef<Path>, pairs: &[(f64, f64)]) -> AppResult<usize> {
    write_pairs(path.as_ref(), CALIBRATION_HEADER, pairs)
}

/// Read `(measured, real in Newtons)` pairs.
pub fn load_calibration(path: impl AsRef<Path>) -> AppResult<Vec<(f64, f64)>> {
    read_pairs(path.as_ref())
}

#[cfg(feature = "storage_csv")]
fn write_pairs(path: &Path, header: [&str; 2], rows: &[(f64, f64)]) -> AppResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    for (a, b) in rows {
        writer.write_record([a.to_string(), b.to_string()])?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows = rows.len(), "Wrote file");
    Ok(rows.len())
}

#[cfg(feature = "storage_csv")]
fn read_pairs(path: &Path) -> AppResult<Vec<(f64, f64)>> {
    // The header row is parsed like any other and fails as non-numeric
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut pairs = Vec::new();
    let mut skipped = 0usize;
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipped unreadable row");
                skipped += 1;
                continue;
            }
        };
        match parse_pair(&record) {
            Some(pair) => pairs.push(pair),
            None if record.position().is_some_and(|p| p.line() == 1) => {
                tracing::debug!(path = %path.display(), row = ?record, "Skipped header row");
            }
            None => {
                tracing::warn!(path = %path.display(), row = ?record, "Skipped malformed row");
                skipped += 1;
            }
        }
    }
    tracing::info!(
        path = %path.display(),
        rows = pairs.len(),
        skipped,
        "Loaded file"
    );
    Ok(pairs)
}

#[cfg(feature = "storage_csv")]
fn parse_pair(record: &csv::StringRecord) -> Option<(f64, f64)> {
    if record.len() != 2 {
        return None;
    }
    let a: f64 = record.get(0)?.parse().ok()?;
    let b: f64 = record.get(1)?.parse().ok()?;
    (a.is_finite() && b.is_finite()).then_some((a, b))
}

#[cfg(not(feature = "storage_csv"))]
fn write_pairs(_path: &Path, _header: [&str; 2], _rows: &[(f64, f64)]) -> AppResult<usize> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}

#[cfg(not(feature = "storage_csv"))]
fn read_pairs(_path: &Path) -> AppResult<Vec<(f64, f64)>> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}
