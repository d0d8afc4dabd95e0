//! Request-plan execution: cache → disk tier → rate limit → retry → fallback,
//! then a join-key merge of the per-endpoint tables.

use super::cache::{CacheStatus, TableCache};
use super::provider::MarketDataProvider;
use super::rate_limit::EndpointLimiter;
use super::store::TableStore;
use super::synthetic::synthetic_provider_table;
use super::FetchError;
use crate::domain::{Column, RowKey, Table};
use crate::selection::{CacheKey, FetchOp, RequestPlan};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Tunables for one fetcher instance, supplied by configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Cache TTL for both the memory cache and the disk tier.
    pub ttl: Duration,
    /// Maximum provider attempts per op (first try included).
    pub max_attempts: u32,
    /// Base delay of the exponential backoff (doubles per attempt).
    pub base_delay: Duration,
    /// Token-bucket refill rate, per endpoint.
    pub rate_per_sec: f64,
    /// Token-bucket burst size, per endpoint.
    pub burst: u32,
    /// Substitute synthetic data after transient retries are exhausted.
    pub fallback_to_synthetic: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            rate_per_sec: 5.0,
            burst: 10,
            fallback_to_synthetic: true,
        }
    }
}

/// Result of executing a plan: the merged table plus which endpoints (if
/// any) were served synthetic data, so callers can tell real from degraded.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub table: Arc<Table>,
    pub synthetic_endpoints: Vec<String>,
}

impl FetchOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.synthetic_endpoints.is_empty()
    }
}

/// Executes request plans. The cache and rate limiter are the only shared
/// mutable state; both are internally synchronized, so one fetcher can be
/// shared (`Arc`) across concurrent strategy runs.
pub struct DataFetcher {
    provider: Arc<dyn MarketDataProvider>,
    cache: TableCache,
    limiter: EndpointLimiter,
    store: Option<TableStore>,
    config: FetchConfig,
    /// Cache keys currently backed by synthetic data.
    synthetic_keys: Mutex<HashSet<CacheKey>>,
}

impl DataFetcher {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: FetchConfig) -> Self {
        Self {
            provider,
            cache: TableCache::new(config.ttl),
            limiter: EndpointLimiter::new(config.rate_per_sec, config.burst),
            store: None,
            config,
            synthetic_keys: Mutex::new(HashSet::new()),
        }
    }

    /// Attach a Parquet disk tier, consulted between memory miss and network.
    pub fn with_store(mut self, store: TableStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Execute a plan: fetch every op, then merge on the join keys. The
    /// deadline bounds the whole execution including rate-limiter waits.
    pub fn execute(&self, plan: &RequestPlan, deadline: Instant) -> Result<FetchOutcome, FetchError> {
        let mut tables = Vec::with_capacity(plan.ops.len());
        let mut synthetic_endpoints = Vec::new();

        for op in &plan.ops {
            let table = self.fetch_op(op, deadline)?;
            if self.synthetic_keys.lock().unwrap().contains(&op.cache_key) {
                synthetic_endpoints.push(op.endpoint.clone());
            }
            tables.push(table);
        }

        let merged = merge_tables(plan, &tables)?;
        Ok(FetchOutcome {
            table: Arc::new(merged),
            synthetic_endpoints,
        })
    }

    /// Fetch one op through the cache layers.
    fn fetch_op(&self, op: &FetchOp, deadline: Instant) -> Result<Arc<Table>, FetchError> {
        let (result, status) = self.cache.get_or_fetch(&op.cache_key, deadline, || {
            if let Some(store) = &self.store {
                if let Some(table) = store.load(&op.cache_key, self.config.ttl) {
                    tracing::debug!(endpoint = %op.endpoint, "disk tier hit");
                    return Ok(table);
                }
            }
            self.fetch_from_provider(op, deadline)
        });
        if status == CacheStatus::Hit {
            tracing::debug!(endpoint = %op.endpoint, "cache hit");
        }
        // A coalesced waiter's timeout comes from the cache, which does not
        // know the endpoint.
        result.map_err(|e| match e {
            FetchError::DeadlineExceeded { endpoint } if endpoint.is_empty() => {
                FetchError::DeadlineExceeded {
                    endpoint: op.endpoint.clone(),
                }
            }
            other => other,
        })
    }

    /// Network fetch with rate limiting, bounded backoff retry, and (when
    /// enabled) synthetic fallback after transient exhaustion.
    fn fetch_from_provider(&self, op: &FetchOp, deadline: Instant) -> Result<Table, FetchError> {
        let bucket = self.limiter.bucket(&op.endpoint);
        let mut attempt: u32 = 0;

        let exhausted = loop {
            if !bucket.acquire_until(deadline) {
                return Err(FetchError::DeadlineExceeded {
                    endpoint: op.endpoint.clone(),
                });
            }
            if Instant::now() >= deadline {
                return Err(FetchError::DeadlineExceeded {
                    endpoint: op.endpoint.clone(),
                });
            }

            match self.provider.fetch(op) {
                Ok(table) => {
                    self.synthetic_keys.lock().unwrap().remove(&op.cache_key);
                    if let Some(store) = &self.store {
                        if let Err(e) = store.save(&op.cache_key, &op.endpoint, &table) {
                            tracing::warn!(endpoint = %op.endpoint, error = %e, "disk tier write failed");
                        }
                    }
                    return Ok(table);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    let delay = self
                        .config
                        .base_delay
                        .checked_mul(1 << attempt)
                        .unwrap_or(self.config.base_delay);
                    tracing::warn!(
                        endpoint = %op.endpoint,
                        attempt = attempt + 1,
                        error = %e,
                        "transient fetch failure, backing off"
                    );
                    let now = Instant::now();
                    if now + delay >= deadline {
                        return Err(FetchError::DeadlineExceeded {
                            endpoint: op.endpoint.clone(),
                        });
                    }
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        if exhausted.is_transient() && self.config.fallback_to_synthetic {
            tracing::warn!(
                endpoint = %op.endpoint,
                error = %exhausted,
                "retries exhausted, substituting synthetic data"
            );
            self.synthetic_keys
                .lock()
                .unwrap()
                .insert(op.cache_key.clone());
            return Ok(synthetic_provider_table(op));
        }
        Err(exhausted)
    }
}

// ── Merge ───────────────────────────────────────────────────────────

/// Merge per-endpoint tables on the plan's join keys.
///
/// The first op is the driver: its rows define the output index, sorted by
/// row key for deterministic downstream ordering. Other tables are joined on
/// whichever join keys they serve (a table without the date key joins by
/// security id alone, broadcasting per-entity attributes across dates).
fn merge_tables(plan: &RequestPlan, tables: &[Arc<Table>]) -> Result<Table, FetchError> {
    let base = tables
        .first()
        .ok_or_else(|| FetchError::MergeError("plan produced no tables".into()))?;

    let mut order: Vec<usize> = (0..base.len()).collect();
    order.sort_by(|&a, &b| base.index()[a].cmp(&base.index()[b]));
    let index: Vec<RowKey> = order.iter().map(|&i| base.index()[i].clone()).collect();

    let mut builder = Table::builder(index);
    let mut present: HashSet<String> = HashSet::new();
    for (name, col) in base.columns() {
        builder = builder
            .column(name, col.take(&order))
            .map_err(|e| FetchError::MergeError(e.to_string()))?;
        present.insert(name.to_string());
    }

    for table in &tables[1..] {
        let keys: Vec<&String> = plan
            .join_keys
            .iter()
            .filter(|k| table.column(k).is_some())
            .collect();
        if keys.is_empty() {
            return Err(FetchError::MergeError(
                "endpoint table shares no join key with the plan".into(),
            ));
        }
        for key in &keys {
            if base.column(key).is_none() {
                return Err(FetchError::MergeError(format!(
                    "driver endpoint does not serve join key '{key}'"
                )));
            }
        }

        // Right-side lookup: join-key tuple → row position.
        let mut lookup: HashMap<Vec<Option<String>>, usize> = HashMap::with_capacity(table.len());
        for j in 0..table.len() {
            let tuple: Vec<Option<String>> =
                keys.iter().map(|k| key_component(table, k, j)).collect();
            lookup.insert(tuple, j);
        }

        // Positions of each output row in the right-side table (if matched).
        let matches: Vec<Option<usize>> = order
            .iter()
            .map(|&i| {
                let tuple: Vec<Option<String>> =
                    keys.iter().map(|k| key_component(base, k, i)).collect();
                lookup.get(&tuple).copied()
            })
            .collect();

        for (name, col) in table.columns() {
            if present.contains(name) {
                if !plan.join_keys.iter().any(|k| k == name) {
                    tracing::debug!(column = %name, "duplicate column across endpoints, keeping driver's");
                }
                continue;
            }
            let joined = take_optional(col, &matches);
            builder = builder
                .column(name, joined)
                .map_err(|e| FetchError::MergeError(e.to_string()))?;
            present.insert(name.to_string());
        }
    }

    Ok(builder.build())
}

/// Render a join-key cell as a canonical string for tuple comparison.
fn key_component(table: &Table, field: &str, row: usize) -> Option<String> {
    match table.column(field)? {
        Column::Str(v) => v[row].clone(),
        Column::Date(v) => v[row].map(|d| d.format("%Y-%m-%d").to_string()),
        Column::Float(v) => v[row].map(|f| format!("{f}")),
    }
}

/// Take rows by optional positions; unmatched rows become missing.
fn take_optional(col: &Column, positions: &[Option<usize>]) -> Column {
    match col {
        Column::Float(v) => Column::Float(positions.iter().map(|p| p.and_then(|i| v[i])).collect()),
        Column::Str(v) => Column::Str(
            positions
                .iter()
                .map(|p| p.and_then(|i| v[i].clone()))
                .collect(),
        ),
        Column::Date(v) => Column::Date(positions.iter().map(|p| p.and_then(|i| v[i])).collect()),
    }
}
