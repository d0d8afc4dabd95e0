//! End-to-end strategy runs against a deterministic in-process provider.

use chrono::NaiveDate;
use factorlab_core::domain::{RowKey, Table};
use factorlab_core::fetch::{DataFetcher, FetchConfig, FetchError, MarketDataProvider, SyntheticProvider};
use factorlab_core::sandbox::FactorCode;
use factorlab_core::score::{MissingPolicy, ScoreOptions, StrategyWeightSet};
use factorlab_core::selection::{EndpointCatalog, FetchOp, RequestParams};
use factorlab_core::standardize::NormalizationPolicy;
use factorlab_runner::{
    daily_contract, export_json, export_scores_csv, import_json, run_strategy, RunnerConfig,
    StrategySpec, UniverseFilter,
};
use factorlab_runner::pipeline::FactorSpec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CODES: [&str; 3] = ["000001.SZ", "000002.SZ", "600000.SH"];
const DAYS: [u32; 2] = [2, 3];

/// Serves two days of daily bars for three securities, with closes that
/// rise strictly in code order on each day.
struct TableProvider {
    calls: AtomicUsize,
}

impl TableProvider {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn daily_table() -> Table {
        let mut index = Vec::new();
        let mut ts_codes = Vec::new();
        let mut closes = Vec::new();
        let mut pre_closes = Vec::new();
        for day in DAYS {
            let date = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
            for (i, code) in CODES.iter().enumerate() {
                index.push(RowKey::new(*code, date));
                ts_codes.push(Some(code.to_string()));
                // Returns 1%, 2%, 3% in code order.
                pre_closes.push(Some(100.0));
                closes.push(Some(100.0 + (i + 1) as f64));
            }
        }
        Table::builder(index)
            .str("ts_code", ts_codes)
            .unwrap()
            .float("close", closes)
            .unwrap()
            .float("pre_close", pre_closes)
            .unwrap()
            .build()
    }
}

impl MarketDataProvider for TableProvider {
    fn name(&self) -> &str {
        "table-fixture"
    }

    fn fetch(&self, _op: &FetchOp) -> Result<Table, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::daily_table())
    }
}

fn request() -> RequestParams {
    BTreeMap::from([
        ("start_date".to_string(), "20240102".to_string()),
        ("end_date".to_string(), "20240103".to_string()),
    ])
}

fn single_factor_strategy() -> StrategySpec {
    StrategySpec {
        factors: vec![FactorSpec {
            id: "ret".into(),
            code: FactorCode::new("(close - pre_close) / pre_close", &["close", "pre_close"]),
            policy: NormalizationPolicy::default(),
            enabled: true,
        }],
        weights: StrategyWeightSet::new([("ret".to_string(), 1.0)]),
        options: ScoreOptions {
            missing: MissingPolicy::Exclude,
            top_n: None,
            group_top_n: Some(3),
        },
    }
}

#[test]
fn zscore_run_ranks_by_raw_value_order_within_each_date() {
    let fetcher = DataFetcher::new(Arc::new(TableProvider::new()), FetchConfig::default());
    let result = run_strategy(
        &fetcher,
        &EndpointCatalog::builtin(),
        &daily_contract(),
        &request(),
        &UniverseFilter::All,
        &single_factor_strategy(),
        &RunnerConfig::default(),
        None,
    )
    .unwrap();

    assert!(!result.is_degraded());
    assert!((result.scoring.coverage - 1.0).abs() < 1e-12);

    // Standardization is monotonic within a group, so each date must rank
    // securities purely by their raw return order.
    for date in ["2024-01-02", "2024-01-03"] {
        let ranked: Vec<&str> = result.scoring.group_top_n[date]
            .iter()
            .map(|row| row.key.ts_code.as_str())
            .collect();
        assert_eq!(ranked, vec!["600000.SH", "000002.SZ", "000001.SZ"]);
    }
}

#[test]
fn second_run_within_ttl_reuses_the_cached_table() {
    let provider = Arc::new(TableProvider::new());
    let fetcher = DataFetcher::new(provider.clone(), FetchConfig::default());

    for _ in 0..2 {
        run_strategy(
            &fetcher,
            &EndpointCatalog::builtin(),
            &daily_contract(),
            &request(),
            &UniverseFilter::All,
            &single_factor_strategy(),
            &RunnerConfig::default(),
            None,
        )
        .unwrap();
    }
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_provider_degrades_to_synthetic_and_flags_it() {
    struct DownProvider;
    impl MarketDataProvider for DownProvider {
        fn name(&self) -> &str {
            "down"
        }
        fn fetch(&self, _op: &FetchOp) -> Result<Table, FetchError> {
            Err(FetchError::ProviderUnavailable("connection refused".into()))
        }
    }

    let config = FetchConfig {
        max_attempts: 2,
        base_delay: std::time::Duration::from_millis(1),
        ..FetchConfig::default()
    };
    let fetcher = DataFetcher::new(Arc::new(DownProvider), config);
    let result = run_strategy(
        &fetcher,
        &EndpointCatalog::builtin(),
        &daily_contract(),
        &request(),
        &UniverseFilter::All,
        &single_factor_strategy(),
        &RunnerConfig::default(),
        None,
    )
    .unwrap();

    assert!(result.is_degraded());
    assert_eq!(result.synthetic_endpoints, vec!["daily"]);
    assert!(!result.scoring.scores.is_empty());
}

#[test]
fn exports_round_trip_a_real_run() {
    let fetcher = DataFetcher::new(Arc::new(SyntheticProvider), FetchConfig::default());
    let strategy = single_factor_strategy();
    let result = run_strategy(
        &fetcher,
        &EndpointCatalog::builtin(),
        &daily_contract(),
        &request(),
        &UniverseFilter::All,
        &strategy,
        &RunnerConfig::default(),
        None,
    )
    .unwrap();

    let json = export_json(&result).unwrap();
    let imported = import_json(&json).unwrap();
    assert_eq!(imported.strategy_fingerprint, strategy.fingerprint());
    assert_eq!(imported.scoring.scores.len(), result.scoring.scores.len());

    let csv = export_scores_csv(&result.scoring).unwrap();
    // Header plus one line per universe row.
    assert_eq!(csv.lines().count(), result.scoring.scores.len() + 1);
}

#[test]
fn diagnostics_flow_through_when_an_outcome_is_supplied() {
    let fetcher = DataFetcher::new(Arc::new(TableProvider::new()), FetchConfig::default());
    // Outcome equal to the raw return: a factor that predicts itself has
    // IC = 1 on every date.
    let table = TableProvider::daily_table();
    let outcome = factorlab_core::domain::FactorSeries::new(
        table.index().to_vec(),
        table
            .float_column("close")
            .unwrap()
            .iter()
            .map(|v| v.map(|c| (c - 100.0) / 100.0))
            .collect(),
    );

    let result = run_strategy(
        &fetcher,
        &EndpointCatalog::builtin(),
        &daily_contract(),
        &request(),
        &UniverseFilter::All,
        &single_factor_strategy(),
        &RunnerConfig::default(),
        Some(&outcome),
    )
    .unwrap();

    let diags = result.scoring.diagnostics.unwrap();
    assert_eq!(diags.len(), 2);
    for diag in diags {
        assert!((diag.ic - 1.0).abs() < 1e-9);
        assert!((diag.rank_ic - 1.0).abs() < 1e-9);
    }
}
