//! Selection resolution — turning a declarative data-selection contract into
//! a materialized request plan.
//!
//! A [`SelectionContract`] names which endpoints and fields a factor needs
//! and how parameters bind to runtime values. [`resolve`] validates it
//! against an [`EndpointCatalog`] and produces a [`RequestPlan`]: one
//! [`FetchOp`] per endpoint with resolved parameter values and a
//! deterministic cache key. Resolution is a pure function: no I/O, no side
//! effects, and identical inputs always hash to identical cache keys.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Invalid-selection failures. Every variant means the contract cannot be
/// turned into a plan; none of them is retryable.
#[derive(Debug, Error, PartialEq)]
pub enum SelectionError {
    #[error("invalid selection: unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("invalid selection: field '{field}' does not exist on endpoint '{endpoint}'")]
    UnknownField { endpoint: String, field: String },

    #[error("invalid selection: join key '{key}' is not a key field of endpoint '{endpoint}'")]
    BadJoinKey { endpoint: String, key: String },

    #[error("invalid selection: output index field '{field}' is not a key field of endpoint '{endpoint}'")]
    BadIndexField { endpoint: String, field: String },

    #[error("invalid selection: parameter '{0}' is bound from the request but missing from it")]
    UnboundParam(String),

    #[error("invalid selection: parameter '{param}' derives from '{from}' which is not a valid date: {value}")]
    UnderivableParam {
        param: String,
        from: String,
        value: String,
    },

    #[error("invalid selection: contract selects no endpoints")]
    EmptySelection,
}

/// Schema of one provider endpoint: which fields it serves and which of
/// those are key fields (usable as join keys / index components).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSchema {
    pub fields: BTreeSet<String>,
    pub key_fields: BTreeSet<String>,
}

/// Catalog of known endpoints, supplied by configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointCatalog {
    endpoints: BTreeMap<String, EndpointSchema>,
}

impl EndpointCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        endpoint: impl Into<String>,
        fields: &[&str],
        key_fields: &[&str],
    ) -> &mut Self {
        self.endpoints.insert(
            endpoint.into(),
            EndpointSchema {
                fields: fields.iter().map(|s| s.to_string()).collect(),
                key_fields: key_fields.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn schema(&self, endpoint: &str) -> Option<&EndpointSchema> {
        self.endpoints.get(endpoint)
    }

    /// The stock-market catalog used by the CLI and tests: daily bars,
    /// daily indicator snapshots, and the security master.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(
            "daily",
            &[
                "ts_code", "trade_date", "open", "high", "low", "close", "pre_close", "pct_chg",
                "vol", "amount",
            ],
            &["ts_code", "trade_date"],
        );
        catalog.register(
            "daily_basic",
            &[
                "ts_code",
                "trade_date",
                "turnover_rate",
                "pe",
                "pb",
                "ps",
                "total_mv",
                "circ_mv",
            ],
            &["ts_code", "trade_date"],
        );
        catalog.register(
            "stock_basic",
            &["ts_code", "name", "industry", "list_date"],
            &["ts_code"],
        );
        catalog
    }
}

/// How a contract parameter gets its value at resolution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamBinding {
    /// A constant baked into the contract.
    Fixed { value: String },
    /// Taken verbatim from the runtime request bag.
    FromRequest { key: String },
    /// Derived from a date-valued request parameter by a day offset
    /// (negative offsets express lookback windows).
    DateOffset { from: String, days: i64 },
}

/// One `(endpoint, fields)` pair of a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSelect {
    pub endpoint: String,
    pub fields: Vec<String>,
}

/// Declarative data-selection contract. Authored externally, consumed
/// read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionContract {
    /// Ordered key field names of the output index, e.g. `ts_code, trade_date`.
    pub output_index: Vec<String>,
    pub selects: Vec<EndpointSelect>,
    pub params: BTreeMap<String, ParamBinding>,
    /// Fields the per-endpoint tables are merged on.
    pub join_keys: Vec<String>,
}

/// Runtime parameter bag accompanying one evaluation request.
pub type RequestParams = BTreeMap<String, String>;

/// Deterministic cache key: blake3 over endpoint + canonical parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One materialized fetch operation against a single endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOp {
    pub endpoint: String,
    /// Fields to request: declared fields plus join keys, deduplicated,
    /// in deterministic order.
    pub fields: Vec<String>,
    pub params: BTreeMap<String, String>,
    pub cache_key: CacheKey,
}

/// A resolved plan: endpoint-keyed fetch operations plus the merge recipe.
/// Ephemeral — recomputed per evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPlan {
    pub ops: Vec<FetchOp>,
    pub output_index: Vec<String>,
    pub join_keys: Vec<String>,
}

/// Resolve a contract against the catalog and a runtime parameter bag.
pub fn resolve(
    contract: &SelectionContract,
    catalog: &EndpointCatalog,
    request: &RequestParams,
) -> Result<RequestPlan, SelectionError> {
    if contract.selects.is_empty() {
        return Err(SelectionError::EmptySelection);
    }

    let params = resolve_params(&contract.params, request)?;

    let mut ops = Vec::with_capacity(contract.selects.len());
    for select in &contract.selects {
        let schema = catalog
            .schema(&select.endpoint)
            .ok_or_else(|| SelectionError::UnknownEndpoint(select.endpoint.clone()))?;

        for field in &select.fields {
            if !schema.fields.contains(field) {
                return Err(SelectionError::UnknownField {
                    endpoint: select.endpoint.clone(),
                    field: field.clone(),
                });
            }
        }
        for key in &contract.join_keys {
            if !schema.key_fields.contains(key) {
                return Err(SelectionError::BadJoinKey {
                    endpoint: select.endpoint.clone(),
                    key: key.clone(),
                });
            }
        }
        // The merged table is keyed by the output index, so every index
        // field an endpoint serves must be one of its key fields.
        for field in &contract.output_index {
            if schema.fields.contains(field) && !schema.key_fields.contains(field) {
                return Err(SelectionError::BadIndexField {
                    endpoint: select.endpoint.clone(),
                    field: field.clone(),
                });
            }
        }

        // Join keys ride along with the declared fields, deduplicated.
        let mut fields: Vec<String> = Vec::new();
        for field in contract.join_keys.iter().chain(&select.fields) {
            if schema.fields.contains(field) && !fields.contains(field) {
                fields.push(field.clone());
            }
        }

        let cache_key = cache_key(&select.endpoint, &fields, &params);
        ops.push(FetchOp {
            endpoint: select.endpoint.clone(),
            fields,
            params: params.clone(),
            cache_key,
        });
    }

    Ok(RequestPlan {
        ops,
        output_index: contract.output_index.clone(),
        join_keys: contract.join_keys.clone(),
    })
}

fn resolve_params(
    bindings: &BTreeMap<String, ParamBinding>,
    request: &RequestParams,
) -> Result<BTreeMap<String, String>, SelectionError> {
    let mut resolved = BTreeMap::new();
    for (name, binding) in bindings {
        let value = match binding {
            ParamBinding::Fixed { value } => value.clone(),
            ParamBinding::FromRequest { key } => request
                .get(key)
                .cloned()
                .ok_or_else(|| SelectionError::UnboundParam(key.clone()))?,
            ParamBinding::DateOffset { from, days } => {
                let base = request
                    .get(from)
                    .ok_or_else(|| SelectionError::UnboundParam(from.clone()))?;
                let date = NaiveDate::parse_from_str(base, "%Y-%m-%d").map_err(|_| {
                    SelectionError::UnderivableParam {
                        param: name.clone(),
                        from: from.clone(),
                        value: base.clone(),
                    }
                })?;
                (date + chrono::Duration::days(*days))
                    .format("%Y-%m-%d")
                    .to_string()
            }
        };
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

/// Hash endpoint + fields + canonical (sorted) params into a cache key.
fn cache_key(endpoint: &str, fields: &[String], params: &BTreeMap<String, String>) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(endpoint.as_bytes());
    hasher.update(b"\x1f");
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update(b",");
    }
    hasher.update(b"\x1f");
    // BTreeMap iteration order is sorted, so the digest is canonical.
    for (k, v) in params {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b";");
    }
    CacheKey(hasher.finalize().to_hex().to_string())
}
