//! Textual artifacts of an analysis
//!
//! - EDC table: `<key>_rir_energy_decay_data.csv`
//! - Summary record: one JSON object per analyzed file, appended to
//!   `summary.jsonl`

use crate::analysis::decay::{DecayAnalysis, EnergyDecayCurve, T60Method};
use crate::store::{write_atomic, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// First line of every EDC table
pub const EDC_CSV_HEADER: &str = "Time (s),Energy Decay (dB)";

/// Summary log file name inside the output directory
pub const SUMMARY_FILE: &str = "summary.jsonl";

pub fn edc_csv_name(key: &str) -> String {
    format!("{key}_rir_energy_decay_data.csv")
}

/// Render the curve as CSV, one row per sample
pub fn render_edc_csv(edc: &EnergyDecayCurve) -> String {
    let mut out = String::with_capacity(EDC_CSV_HEADER.len() + edc.len() * 24);
    out.push_str(EDC_CSV_HEADER);
    out.push('\n');
    for (t, db) in edc.points() {
        let _ = writeln!(out, "{t},{db}");
    }
    out
}

/// Write the EDC table for `key` into `dir`
pub fn write_edc_csv(dir: &Path, key: &str, edc: &EnergyDecayCurve) -> Result<PathBuf, StoreError> {
    let path = dir.join(edc_csv_name(key));
    write_atomic(&path, render_edc_csv(edc).as_bytes())?;
    tracing::info!(path = %path.display(), rows = edc.len(), "Wrote EDC table");
    Ok(path)
}

/// Per-file result record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecaySummary {
    /// Session key or file the analysis ran on
    pub source: String,
    pub t20_t60: Option<f64>,
    pub t25_t60: Option<f64>,
    pub t30_t60: Option<f64>,
    pub t20_valid: bool,
    pub t25_valid: bool,
    pub t30_valid: bool,
    /// Detected EDC noise floor in dB
    pub noise_floor_db: f64,
    /// Direct-sound delay in the recording, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_delay_ms: Option<f64>,
    /// Playback gain used for the capture, when measured live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    pub analyzed_at: DateTime<Utc>,
}

impl DecaySummary {
    pub fn from_analysis(source: impl Into<String>, analysis: &DecayAnalysis) -> Self {
        let valid = |m| analysis.estimate(m).is_some_and(|e| e.valid);
        Self {
            source: source.into(),
            t20_t60: analysis.t60(T60Method::T20),
            t25_t60: analysis.t60(T60Method::T25),
            t30_t60: analysis.t60(T60Method::T30),
            t20_valid: valid(T60Method::T20),
            t25_valid: valid(T60Method::T25),
            t30_valid: valid(T60Method::T30),
            noise_floor_db: analysis.noise_floor.level_db,
            direct_delay_ms: None,
            scale: None,
            analyzed_at: Utc::now(),
        }
    }

    pub fn with_direct_delay_ms(mut self, delay_ms: f64) -> Self {
        self.direct_delay_ms = Some(delay_ms);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }
}

/// Append one record to `<dir>/summary.jsonl`
pub fn append_summary(dir: &Path, summary: &DecaySummary) -> Result<PathBuf, StoreError> {
    let path = dir.join(SUMMARY_FILE);
    let mut line = serde_json::to_string(summary)?;
    line.push('\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.write_all(line.as_bytes())?;
    tracing::debug!(path = %path.display(), source = %summary.source, "Appended summary");
    Ok(path)
}

/// All records of `<dir>/summary.jsonl`, oldest first; empty if absent
pub fn read_summaries(dir: &Path) -> Result<Vec<DecaySummary>, StoreError> {
    let path = dir.join(SUMMARY_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = std::io::BufReader::new(std::fs::File::open(&path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Human readable estimator table
pub fn format_estimates(analysis: &DecayAnalysis) -> String {
    let mut out = String::new();
    for e in &analysis.estimates {
        let (_, lower) = e.window;
        match e.t60_seconds {
            Some(t60) => {
                let _ = writeln!(
                    out,
                    "| {} fit ({lower:.0} dB): T60 = {t60:.3} s, slope = {:.3} dB/s, {} points",
                    e.method, e.slope, e.points
                );
            }
            None => {
                let reason = e
                    .invalid_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".into());
                let _ = writeln!(out, "| {} fit ({lower:.0} dB): FAILED ({reason})", e.method);
            }
        }
    }
    let _ = writeln!(
        out,
        "| noise floor: {:.1} dB{}",
        analysis.noise_floor.level_db,
        if analysis.noise_floor.detected {
            ""
        } else {
            " (end of curve)"
        }
    );
    out
}
