//! Strategy-run orchestration: resolve → fetch → per-factor fan-out → score.
//!
//! One run fetches its merged table once, then evaluates every enabled
//! factor in parallel (sandbox → standardize). Factors share nothing but
//! the immutable table, so one factor's failure never cancels its
//! siblings; the run reports partial success per factor and scores with
//! whatever survived. A run-wide deadline aborts with a typed timeout.

use crate::config::RunnerConfig;
use crate::universe::{UniverseError, UniverseFilter};
use factorlab_core::domain::{FactorSeries, Table};
use factorlab_core::fetch::{DataFetcher, FetchError};
use factorlab_core::sandbox::{self, FactorCode};
use factorlab_core::score::{self, ScoreError, ScoreOptions, ScoringResult, StrategyWeightSet};
use factorlab_core::selection::{
    self, EndpointCatalog, RequestParams, SelectionContract, SelectionError,
};
use factorlab_core::standardize::{self, GroupStats, NormalizationPolicy};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Run-level failures. Per-factor failures are not here — they live in
/// [`FactorReport`] so a run can succeed partially.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Universe(#[from] UniverseError),

    #[error(transparent)]
    Score(#[from] ScoreError),

    #[error("run deadline exceeded during {phase}")]
    DeadlineExceeded { phase: &'static str },

    #[error("weight references unknown factor id '{id}'")]
    UnknownWeightId { id: String },

    #[error("no enabled factor produced a usable series")]
    NoFactorSucceeded,
}

/// One factor of a strategy: id, untrusted code, and its normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSpec {
    pub id: String,
    pub code: FactorCode,
    pub policy: NormalizationPolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A complete strategy definition as authored externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub factors: Vec<FactorSpec>,
    pub weights: StrategyWeightSet,
    #[serde(default)]
    pub options: ScoreOptions,
}

impl StrategySpec {
    /// Deterministic content hash of the strategy definition. Two runs of
    /// the same strategy carry the same fingerprint, so exports can be
    /// correlated across runs.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).expect("StrategySpec serialization failed");
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }
}

/// Per-factor outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FactorOutcome {
    Succeeded {
        missing: usize,
        group_stats: Vec<GroupStats>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorReport {
    pub id: String,
    pub outcome: FactorOutcome,
}

impl FactorReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, FactorOutcome::Succeeded { .. })
    }
}

/// Everything one strategy run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub scoring: ScoringResult,
    pub reports: Vec<FactorReport>,
    /// Endpoints that were served synthetic data instead of real data.
    pub synthetic_endpoints: Vec<String>,
    /// Content hash of the strategy that produced this result.
    pub strategy_fingerprint: String,
}

impl RunResult {
    /// True when any endpoint fell back to synthetic data.
    pub fn is_degraded(&self) -> bool {
        !self.synthetic_endpoints.is_empty()
    }
}

/// Execute one full strategy run.
///
/// The fetched table is shared immutably across the factor fan-out; the
/// fetcher's cache and rate limiter are the only shared mutable state.
#[allow(clippy::too_many_arguments)]
pub fn run_strategy(
    fetcher: &DataFetcher,
    catalog: &EndpointCatalog,
    contract: &SelectionContract,
    request: &RequestParams,
    universe: &UniverseFilter,
    strategy: &StrategySpec,
    config: &RunnerConfig,
    outcome: Option<&FactorSeries>,
) -> Result<RunResult, RunError> {
    // Weights must name declared factors. Checked before any fetching so a
    // typo'd id fails fast instead of silently dropping out of the composite.
    for (id, _) in strategy.weights.iter() {
        if !strategy.factors.iter().any(|f| f.id == id) {
            return Err(RunError::UnknownWeightId { id: id.to_string() });
        }
    }

    let deadline = Instant::now() + config.run_deadline();
    let plan = selection::resolve(contract, catalog, request)?;

    let fetched = fetcher.execute(&plan, deadline)?;
    let table = scope_to_universe(&fetched.table, universe)?;
    tracing::info!(
        rows = table.len(),
        factors = strategy.factors.len(),
        degraded = fetched.is_degraded(),
        "table fetched, fanning out"
    );

    if Instant::now() >= deadline {
        return Err(RunError::DeadlineExceeded { phase: "fetch" });
    }

    let mut budget = config.execution_budget();
    budget.timeout = budget
        .timeout
        .min(deadline.saturating_duration_since(Instant::now()));

    let enabled: Vec<&FactorSpec> = strategy.factors.iter().filter(|f| f.enabled).collect();
    let evaluated: Vec<(String, Result<standardize::Standardized, String>)> = enabled
        .par_iter()
        .map(|spec| {
            let result = evaluate_factor(spec, &table, &budget);
            if let Err(error) = &result {
                tracing::warn!(factor = %spec.id, %error, "factor failed");
            }
            (spec.id.clone(), result)
        })
        .collect();

    if Instant::now() >= deadline {
        return Err(RunError::DeadlineExceeded { phase: "factor evaluation" });
    }

    let mut reports = Vec::with_capacity(evaluated.len());
    let mut series: BTreeMap<String, FactorSeries> = BTreeMap::new();
    for (id, result) in evaluated {
        match result {
            Ok(standardized) => {
                reports.push(FactorReport {
                    id: id.clone(),
                    outcome: FactorOutcome::Succeeded {
                        missing: standardized.series.missing_count(),
                        group_stats: standardized.group_stats,
                    },
                });
                series.insert(id, standardized.series);
            }
            Err(error) => reports.push(FactorReport {
                id,
                outcome: FactorOutcome::Failed { error },
            }),
        }
    }

    // Score with whatever survived; weights for failed factors drop out
    // and the remainder renormalizes inside the scorer.
    let surviving = StrategyWeightSet::new(
        strategy
            .weights
            .iter()
            .filter(|(id, _)| series.contains_key(*id))
            .map(|(id, w)| (id.to_string(), w)),
    );
    if surviving.is_empty() {
        return Err(RunError::NoFactorSucceeded);
    }

    let scoring = score::score_strategy(
        table.index(),
        &series,
        &surviving,
        &strategy.options,
        outcome,
    )?;

    Ok(RunResult {
        scoring,
        reports,
        synthetic_endpoints: fetched.synthetic_endpoints,
        strategy_fingerprint: strategy.fingerprint(),
    })
}

/// Sandbox-evaluate one factor and standardize its raw series. Failures
/// collapse to a message string so the report stays serializable.
fn evaluate_factor(
    spec: &FactorSpec,
    table: &Table,
    budget: &sandbox::ExecutionBudget,
) -> Result<standardize::Standardized, String> {
    let raw = sandbox::execute_factor(&spec.code, table, budget).map_err(|e| e.to_string())?;
    standardize::standardize(&raw, &spec.policy).map_err(|e| e.to_string())
}

/// Cut the merged table down to the rows the universe filter selects.
fn scope_to_universe(table: &Arc<Table>, universe: &UniverseFilter) -> Result<Arc<Table>, RunError> {
    if matches!(universe, UniverseFilter::All) {
        return Ok(Arc::clone(table));
    }
    let codes: HashSet<String> = universe.resolve(table)?.into_iter().collect();
    let positions = table.positions_for_codes(&codes);
    if positions.is_empty() {
        return Err(RunError::Universe(UniverseError::EmptyUniverse));
    }
    Ok(Arc::new(table.select_rows(&positions)))
}

/// Convenience for previews and tests: the standard catalog plus a
/// daily-bars contract over a code list and date range.
pub fn daily_contract() -> SelectionContract {
    SelectionContract {
        output_index: vec!["ts_code".into(), "trade_date".into()],
        selects: vec![selection::EndpointSelect {
            endpoint: "daily".into(),
            fields: vec![
                "open".into(),
                "high".into(),
                "low".into(),
                "close".into(),
                "pre_close".into(),
                "vol".into(),
                "amount".into(),
            ],
        }],
        params: BTreeMap::from([
            (
                "start_date".into(),
                selection::ParamBinding::FromRequest {
                    key: "start_date".into(),
                },
            ),
            (
                "end_date".into(),
                selection::ParamBinding::FromRequest {
                    key: "end_date".into(),
                },
            ),
        ]),
        join_keys: vec!["ts_code".into(), "trade_date".into()],
    }
}
