//! Export of run results — JSON with schema versioning, CSV for
//! external analysis tools.
//!
//! All persisted artifacts carry a `schema_version` field; unknown
//! versions are rejected on load.

use crate::pipeline::{FactorReport, RunResult};
use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use factorlab_core::score::ScoringResult;
use serde::{Deserialize, Serialize};

/// Bump when the exported shape changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// The persisted form of a run result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedRun {
    pub schema_version: u32,
    pub generated_at: NaiveDateTime,
    pub scoring: ScoringResult,
    pub reports: Vec<FactorReport>,
    pub synthetic_endpoints: Vec<String>,
    pub strategy_fingerprint: String,
}

impl ExportedRun {
    pub fn from_result(result: &RunResult) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            generated_at: chrono::Utc::now().naive_utc(),
            scoring: result.scoring.clone(),
            reports: result.reports.clone(),
            synthetic_endpoints: result.synthetic_endpoints.clone(),
            strategy_fingerprint: result.strategy_fingerprint.clone(),
        }
    }
}

// ─── JSON ───────────────────────────────────────────────────────────

/// Serialize a run result to pretty JSON.
pub fn export_json(result: &RunResult) -> Result<String> {
    serde_json::to_string_pretty(&ExportedRun::from_result(result))
        .context("failed to serialize run result to JSON")
}

/// Deserialize an exported run, rejecting unknown schema versions.
pub fn import_json(json: &str) -> Result<ExportedRun> {
    let exported: ExportedRun =
        serde_json::from_str(json).context("failed to deserialize exported run")?;
    if exported.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            exported.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(exported)
}

// ─── CSV ────────────────────────────────────────────────────────────

/// Export composite scores as CSV, one row per scored universe row.
///
/// Columns: ts_code, date, score, rank. Unscored rows keep an empty
/// score and rank so the universe stays visible.
pub fn export_scores_csv(scoring: &ScoringResult) -> Result<String> {
    let mut ranks = std::collections::HashMap::new();
    for row in &scoring.top_n {
        ranks.insert(&row.key, row.rank);
    }

    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["ts_code", "date", "score", "rank"])?;
    for (key, score) in &scoring.scores {
        wtr.write_record([
            key.ts_code.as_str(),
            &key.date.format("%Y-%m-%d").to_string(),
            &score.map(|s| format!("{s:.6}")).unwrap_or_default(),
            &ranks.get(key).map(|r| r.to_string()).unwrap_or_default(),
        ])?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}
