//! FactorLab Core — the factor data-to-score pipeline.
//!
//! This crate contains the heart of the factor research engine:
//! - Domain types (row keys, typed tables, factor series)
//! - Selection resolution (declarative data contracts → fetch plans)
//! - Data fetching with caching, rate limiting, retry, and synthetic fallback
//! - Sandboxed evaluation of untrusted factor formulas
//! - Grouped standardization (winsorize → fill → normalize, with diagnostics)
//! - Strategy scoring (L1-normalized weights → composite → ranking → IC)
//!
//! Control flow through a run: resolve a [`selection::SelectionContract`]
//! into a [`selection::RequestPlan`], execute it with a [`fetch::DataFetcher`],
//! evaluate each factor's code via [`sandbox::execute_factor`] against the
//! merged table, standardize each raw series, then fan in to
//! [`score::score_strategy`].

pub mod domain;
pub mod fetch;
pub mod sandbox;
pub mod score;
pub mod selection;
pub mod standardize;

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn domain_types_are_send_sync() {
        assert_send::<domain::RowKey>();
        assert_sync::<domain::RowKey>();
        assert_send::<domain::Table>();
        assert_sync::<domain::Table>();
        assert_send::<domain::FactorSeries>();
        assert_sync::<domain::FactorSeries>();
    }

    #[test]
    fn plan_types_are_send_sync() {
        assert_send::<selection::SelectionContract>();
        assert_sync::<selection::SelectionContract>();
        assert_send::<selection::RequestPlan>();
        assert_sync::<selection::RequestPlan>();
    }

    // The fetcher is shared across rayon workers; everything it holds must
    // cross thread boundaries.
    #[test]
    fn fetch_types_are_send_sync() {
        assert_send::<fetch::DataFetcher>();
        assert_sync::<fetch::DataFetcher>();
        assert_send::<fetch::TableCache>();
        assert_sync::<fetch::TableCache>();
        assert_send::<fetch::EndpointLimiter>();
        assert_sync::<fetch::EndpointLimiter>();
        assert_send::<fetch::FetchOutcome>();
        assert_sync::<fetch::FetchOutcome>();
    }

    #[test]
    fn sandbox_types_are_send_sync() {
        assert_send::<sandbox::FactorCode>();
        assert_sync::<sandbox::FactorCode>();
        assert_send::<sandbox::ExecutionBudget>();
        assert_sync::<sandbox::ExecutionBudget>();
        assert_send::<sandbox::SandboxError>();
        assert_sync::<sandbox::SandboxError>();
    }

    #[test]
    fn policy_and_result_types_are_send_sync() {
        assert_send::<standardize::NormalizationPolicy>();
        assert_sync::<standardize::NormalizationPolicy>();
        assert_send::<standardize::Standardized>();
        assert_sync::<standardize::Standardized>();
        assert_send::<score::StrategyWeightSet>();
        assert_sync::<score::StrategyWeightSet>();
        assert_send::<score::ScoringResult>();
        assert_sync::<score::ScoringResult>();
    }
}
