//! FactorLab CLI — strategy runs, factor validation, and previews.
//!
//! Commands:
//! - `run` — execute a strategy (JSON file) over a date range and export results
//! - `validate` — statically check a factor file without executing it
//! - `test` — evaluate a factor against a synthetic sample and show a preview
//! - `preview` — standardize a CSV of raw values and print the result

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use factorlab_core::fetch::{DataFetcher, HttpProvider, MarketDataProvider, SyntheticProvider, TableStore};
use factorlab_core::sandbox::FactorCode;
use factorlab_core::selection::EndpointCatalog;
use factorlab_core::standardize::{Fill, GroupBy, Method, NormalizationPolicy};
use factorlab_runner::{
    daily_contract, export_json, export_scores_csv, run_strategy, standardize_preview,
    test_factor, validate_factor, RunnerConfig, StrategySpec, UniverseFilter, ValidationOutcome,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "factorlab", about = "FactorLab CLI — factor research pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a strategy run and export the ranked scores.
    Run {
        /// Path to a TOML runner config. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to the strategy definition (JSON).
        #[arg(long)]
        strategy: PathBuf,

        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// End date (YYYY-MM-DD).
        #[arg(long)]
        end: String,

        /// Restrict the universe to these comma-separated codes.
        #[arg(long)]
        codes: Option<String>,

        /// Restrict the universe to codes from this CSV file (ts_code column).
        #[arg(long)]
        universe_csv: Option<PathBuf>,

        /// Offline mode: serve every endpoint synthetic data, no network.
        #[arg(long, default_value_t = false)]
        offline: bool,

        /// Output directory for result JSON and CSV.
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,
    },
    /// Statically check a factor file (JSON: source + inputs).
    Validate {
        factor: PathBuf,
    },
    /// Evaluate a factor against a synthetic sample and show a preview.
    Test {
        factor: PathBuf,

        /// Normalization method for the previewed series.
        #[arg(long, value_enum, default_value_t = MethodArg::Zscore)]
        method: MethodArg,
    },
    /// Standardize a one-column CSV of raw values (header `value`).
    Preview {
        values: PathBuf,

        #[arg(long, value_enum, default_value_t = MethodArg::Zscore)]
        method: MethodArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MethodArg {
    Zscore,
    RobustZscore,
    Rank,
    Minmax,
}

impl From<MethodArg> for Method {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Zscore => Method::ZScore,
            MethodArg::RobustZscore => Method::RobustZScore,
            MethodArg::Rank => Method::Rank,
            MethodArg::Minmax => Method::MinMax,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            strategy,
            start,
            end,
            codes,
            universe_csv,
            offline,
            output_dir,
        } => cmd_run(
            config,
            strategy,
            &start,
            &end,
            codes,
            universe_csv,
            offline,
            output_dir,
        ),
        Commands::Validate { factor } => cmd_validate(&factor),
        Commands::Test { factor, method } => cmd_test(&factor, method),
        Commands::Preview { values, method } => cmd_preview(&values, method),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    config_path: Option<PathBuf>,
    strategy_path: PathBuf,
    start: &str,
    end: &str,
    codes: Option<String>,
    universe_csv: Option<PathBuf>,
    offline: bool,
    output_dir: PathBuf,
) -> Result<()> {
    NaiveDate::parse_from_str(start, "%Y-%m-%d").context("invalid --start date")?;
    NaiveDate::parse_from_str(end, "%Y-%m-%d").context("invalid --end date")?;

    let config = match config_path {
        Some(path) => RunnerConfig::from_file(&path)?,
        None => RunnerConfig::default(),
    };
    let strategy: StrategySpec = serde_json::from_str(
        &std::fs::read_to_string(&strategy_path)
            .with_context(|| format!("failed to read {}", strategy_path.display()))?,
    )
    .context("failed to parse strategy JSON")?;

    let universe = match (codes, universe_csv) {
        (Some(_), Some(_)) => bail!("--codes and --universe-csv are mutually exclusive"),
        (Some(list), None) => UniverseFilter::TsCodes {
            codes: list.split(',').map(|c| c.trim().to_string()).collect(),
        },
        (None, Some(path)) => UniverseFilter::from_csv(&path)?,
        (None, None) => UniverseFilter::All,
    };

    let provider: Arc<dyn MarketDataProvider> = if offline {
        Arc::new(SyntheticProvider)
    } else {
        Arc::new(HttpProvider::new(
            config.provider.base_url.clone(),
            config.provider.token.clone(),
        ))
    };
    let mut fetcher = DataFetcher::new(provider, config.fetch_config());
    if let Some(dir) = &config.cache.dir {
        fetcher = fetcher.with_store(TableStore::new(dir));
    }

    let request = BTreeMap::from([
        ("start_date".to_string(), start.to_string()),
        ("end_date".to_string(), end.to_string()),
    ]);
    let result = run_strategy(
        &fetcher,
        &EndpointCatalog::builtin(),
        &daily_contract(),
        &request,
        &universe,
        &strategy,
        &config,
        None,
    )?;

    if result.is_degraded() {
        eprintln!(
            "warning: synthetic data substituted for: {}",
            result.synthetic_endpoints.join(", ")
        );
    }
    for report in &result.reports {
        if !report.succeeded() {
            eprintln!("factor '{}' failed: {:?}", report.id, report.outcome);
        }
    }
    println!(
        "scored {} rows, coverage {:.1}%",
        result.scoring.scores.len(),
        result.scoring.coverage * 100.0
    );
    for row in result.scoring.top_n.iter().take(10) {
        println!("{:>4}. {}  {:+.4}", row.rank, row.key, row.score);
    }

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let json_path = output_dir.join("run.json");
    std::fs::write(&json_path, export_json(&result)?)?;
    let csv_path = output_dir.join("scores.csv");
    std::fs::write(&csv_path, export_scores_csv(&result.scoring)?)?;
    println!("results written to {}", output_dir.display());
    Ok(())
}

fn cmd_validate(factor_path: &PathBuf) -> Result<()> {
    let code = load_factor(factor_path)?;
    match validate_factor(&code) {
        ValidationOutcome::Passed { report } => {
            println!("PASS");
            println!("used fields:   {}", report.used_fields.join(", "));
            if !report.unused_inputs.is_empty() {
                println!("unused inputs: {}", report.unused_inputs.join(", "));
            }
            Ok(())
        }
        ValidationOutcome::Rejected { error } => {
            eprintln!("FAIL: {error}");
            std::process::exit(1);
        }
    }
}

fn cmd_test(factor_path: &PathBuf, method: MethodArg) -> Result<()> {
    let code = load_factor(factor_path)?;
    let policy = policy_for(method);
    let report = test_factor(&code, &policy, &Default::default())?;

    println!("used fields: {}", report.report.used_fields.join(", "));
    println!("missing raw values: {}", report.missing);
    println!("{:<24} {:>12} {:>12}", "row", "raw", "standardized");
    for ((key, raw), (_, scaled)) in report.raw_head.iter().zip(&report.standardized_head) {
        println!("{key:<24} {:>12} {:>12}", fmt_opt(*raw), fmt_opt(*scaled));
    }
    Ok(())
}

fn cmd_preview(values_path: &PathBuf, method: MethodArg) -> Result<()> {
    let content = std::fs::read_to_string(values_path)
        .with_context(|| format!("failed to read {}", values_path.display()))?;
    let mut values = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if i == 0 && line == "value" {
            continue;
        }
        if line.is_empty() {
            values.push(None);
        } else {
            values.push(Some(line.parse::<f64>().with_context(|| {
                format!("line {}: '{line}' is not a number", i + 1)
            })?));
        }
    }

    let out = standardize_preview(&values, &policy_for(method))?;
    for (raw, std) in values.iter().zip(&out.series.values) {
        println!("{:>12} -> {:>12}", fmt_opt(*raw), fmt_opt(*std));
    }
    for stats in &out.group_stats {
        println!(
            "n={} missing={:.1}% mean={:.4} std={:.4} skew={:.4} kurt={:.4}",
            stats.count,
            stats.missing_rate * 100.0,
            stats.mean,
            stats.std,
            stats.skewness,
            stats.kurtosis
        );
    }
    Ok(())
}

fn load_factor(path: &PathBuf) -> Result<FactorCode> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).context("failed to parse factor JSON (expected {source, inputs})")
}

fn policy_for(method: MethodArg) -> NormalizationPolicy {
    NormalizationPolicy {
        method: method.into(),
        winsor_lower: 0.01,
        winsor_upper: 0.99,
        fill: Fill::Median,
        group_by: GroupBy::Date,
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.4}"),
        None => "—".to_string(),
    }
}
