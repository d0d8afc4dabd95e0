//! Preview operations — the lightweight, single-shot counterparts of a
//! full strategy run, used by authoring surfaces to check a factor or a
//! normalization policy before wiring it into a strategy.

use crate::pipeline::daily_contract;
use factorlab_core::domain::{FactorSeries, RowKey};
use factorlab_core::fetch::{synthetic_provider_table, FetchError};
use factorlab_core::sandbox::{self, ExecutionBudget, FactorCode, SandboxError, ValidationReport};
use factorlab_core::selection::{self, EndpointCatalog, RequestParams, SelectionError};
use factorlab_core::standardize::{
    standardize, GroupStats, NormalizationError, NormalizationPolicy, Standardized,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Standardize a bag of raw values as one cross-sectional group.
///
/// Values arrive without an index (they are pasted numbers, not market
/// rows), so a synthetic single-date index is laid under them.
pub fn standardize_preview(
    values: &[Option<f64>],
    policy: &NormalizationPolicy,
) -> Result<Standardized, NormalizationError> {
    let date = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    let index: Vec<RowKey> = (0..values.len())
        .map(|i| RowKey::new(format!("{i:06}"), date))
        .collect();
    standardize(&FactorSeries::new(index, values.to_vec()), policy)
}

/// Outcome of a static factor check: pass with a field-usage report, or
/// the sandbox rejection, without ever executing the code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Passed { report: ValidationReport },
    Rejected { error: String },
}

/// Statically validate factor code. Rejections are data, not errors: the
/// caller is asking "would this pass", so an unsafe formula is a normal
/// answer.
pub fn validate_factor(code: &FactorCode) -> ValidationOutcome {
    match sandbox::validate_factor(code) {
        Ok(report) => ValidationOutcome::Passed { report },
        Err(error) => ValidationOutcome::Rejected {
            error: error.to_string(),
        },
    }
}

/// Result of a small-sample factor test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorTestReport {
    pub report: ValidationReport,
    /// First rows of the raw series, as (row key, value) pairs.
    pub raw_head: Vec<(String, Option<f64>)>,
    /// Same rows after standardization.
    pub standardized_head: Vec<(String, Option<f64>)>,
    pub group_stats: Vec<GroupStats>,
    pub missing: usize,
}

const TEST_HEAD_ROWS: usize = 12;

/// Evaluate factor code against a deterministic synthetic sample and
/// return the head of the raw and standardized series.
pub fn test_factor(
    code: &FactorCode,
    policy: &NormalizationPolicy,
    budget: &ExecutionBudget,
) -> Result<FactorTestReport, PreviewError> {
    let report = sandbox::validate_factor(code)?;

    let request: RequestParams = BTreeMap::from([
        ("start_date".to_string(), "2024-01-02".to_string()),
        ("end_date".to_string(), "2024-01-09".to_string()),
    ]);
    let plan = selection::resolve(&daily_contract(), &EndpointCatalog::builtin(), &request)?;
    let table = synthetic_provider_table(&plan.ops[0]);

    let raw = sandbox::execute_factor(code, &table, budget)?;
    let standardized = standardize(&raw, policy)?;

    Ok(FactorTestReport {
        report,
        raw_head: head(&raw),
        standardized_head: head(&standardized.series),
        group_stats: standardized.group_stats,
        missing: raw.missing_count(),
    })
}

fn head(series: &FactorSeries) -> Vec<(String, Option<f64>)> {
    series
        .index
        .iter()
        .zip(&series.values)
        .take(TEST_HEAD_ROWS)
        .map(|(key, value)| (key.to_string(), *value))
        .collect()
}
