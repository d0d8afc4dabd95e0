//! FactorLab Runner — strategy-run orchestration on top of `factorlab-core`.
//!
//! This crate builds on the core pipeline to provide:
//! - TOML configuration with defaults for every knob
//! - Universe resolution (all / explicit codes / industry, CSV loading)
//! - Full strategy runs with parallel factor fan-out and partial success
//! - Preview operations (standardize preview, factor validation, factor test)
//! - Schema-versioned JSON and CSV exports

pub mod config;
pub mod export;
pub mod pipeline;
pub mod preview;
pub mod universe;

pub use config::{ConfigError, RunnerConfig};
pub use export::{export_json, export_scores_csv, import_json, ExportedRun, SCHEMA_VERSION};
pub use pipeline::{
    daily_contract, run_strategy, FactorOutcome, FactorReport, FactorSpec, RunError, RunResult,
    StrategySpec,
};
pub use preview::{
    standardize_preview, test_factor, validate_factor, FactorTestReport, PreviewError,
    ValidationOutcome,
};
pub use universe::{UniverseError, UniverseFilter};
