//! Runner configuration, deserialized from TOML.
//!
//! Every field has a default so a partial (or empty) config file is valid.
//! The core never reads configuration itself; this module translates the
//! file into the typed knobs the core components take.

use factorlab_core::fetch::FetchConfig;
use factorlab_core::sandbox::ExecutionBudget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub provider: ProviderConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub sandbox: SandboxConfig,
    pub run: RunConfig,
}

/// External market-data provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Provider API token. Empty means unauthenticated (synthetic/demo use).
    pub token: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://api.tushare.pro".into(),
            token: String::new(),
        }
    }
}

/// Fetch cache settings: in-memory TTL plus an optional parquet disk tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Disk cache directory. `None` keeps the cache memory-only.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            dir: None,
        }
    }
}

/// Per-endpoint token-bucket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_sec: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_sec: 5.0,
            burst: 10,
        }
    }
}

/// Sandbox resource limits per factor execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub max_cells: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            max_cells: 10_000_000,
        }
    }
}

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Wall-clock deadline for one whole strategy run.
    pub deadline_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub fallback_to_synthetic: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 120,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            fallback_to_synthetic: true,
        }
    }
}

impl RunnerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// The core fetcher's knobs, assembled from the cache, rate-limit,
    /// and run sections.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            ttl: Duration::from_secs(self.cache.ttl_secs),
            max_attempts: self.run.retry_max_attempts,
            base_delay: Duration::from_millis(self.run.retry_base_delay_ms),
            rate_per_sec: self.rate_limit.per_sec,
            burst: self.rate_limit.burst,
            fallback_to_synthetic: self.run.fallback_to_synthetic,
        }
    }

    pub fn execution_budget(&self) -> ExecutionBudget {
        ExecutionBudget {
            timeout: Duration::from_millis(self.sandbox.timeout_ms),
            max_cells: self.sandbox.max_cells,
        }
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run.deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = RunnerConfig::from_toml("").unwrap();
        assert_eq!(config.cache.ttl_secs, 600);
        assert_eq!(config.rate_limit.burst, 10);
        assert_eq!(config.sandbox.timeout_ms, 2_000);
        assert!(config.run.fallback_to_synthetic);
        assert!(config.cache.dir.is_none());
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config = RunnerConfig::from_toml(
            r#"
            [cache]
            ttl_secs = 60
            dir = "/tmp/factorlab"

            [rate_limit]
            per_sec = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.dir.as_deref(), Some(Path::new("/tmp/factorlab")));
        assert!((config.rate_limit.per_sec - 1.5).abs() < 1e-12);
        // Untouched sections keep defaults.
        assert_eq!(config.rate_limit.burst, 10);
        assert_eq!(config.run.deadline_secs, 120);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            RunnerConfig::from_toml("cache = 'not a table'"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn fetch_config_assembles_core_knobs() {
        let config = RunnerConfig::from_toml("[run]\nretry_max_attempts = 5").unwrap();
        let fetch = config.fetch_config();
        assert_eq!(fetch.max_attempts, 5);
        assert_eq!(fetch.ttl, Duration::from_secs(600));
    }
}
