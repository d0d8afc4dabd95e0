//! Data fetching — executes a [`RequestPlan`](crate::selection::RequestPlan)
//! against an external market-data provider.
//!
//! Layered per operation: in-memory TTL cache (single-flight per key) →
//! Parquet disk tier → token-bucket rate limiter → HTTP provider with
//! bounded exponential-backoff retry → deterministic synthetic fallback.
//! Per-endpoint tables are merged on the contract's join keys into one
//! table ordered by the output index.

mod cache;
mod fetcher;
mod provider;
mod rate_limit;
mod store;
mod synthetic;

pub use cache::{CacheStatus, TableCache};
pub use fetcher::{DataFetcher, FetchConfig, FetchOutcome};
pub use provider::{HttpProvider, MarketDataProvider};
pub use rate_limit::{EndpointLimiter, TokenBucket};
pub use store::TableStore;
pub use synthetic::{synthetic_provider_table, SyntheticProvider};

use thiserror::Error;

/// Fetch-layer errors. `Clone` so a single-flight leader's failure can be
/// handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Transient provider failure (timeout, connection error, 5xx).
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider-side rate limit (HTTP 429) or local limiter starvation.
    #[error("rate limit exceeded on endpoint '{endpoint}'")]
    RateLimitExceeded { endpoint: String },

    /// Credentials rejected. Never retried.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The provider rejected the request shape. Never retried.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The fetch deadline passed before the operation completed.
    #[error("deadline exceeded while fetching endpoint '{endpoint}'")]
    DeadlineExceeded { endpoint: String },

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("store error: {0}")]
    StoreError(String),

    /// Per-endpoint tables could not be merged on the join keys.
    #[error("merge error: {0}")]
    MergeError(String),
}

impl FetchError {
    /// Whether this failure may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::ProviderUnavailable(_) | FetchError::RateLimitExceeded { .. }
        )
    }
}
