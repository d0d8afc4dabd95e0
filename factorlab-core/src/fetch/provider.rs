//! Market-data provider trait and the HTTP JSON implementation.
//!
//! The provider speaks a tushare-style POST API: the request carries
//! `api_name`, `token`, `params`, and a comma-joined `fields` list; the
//! response is `{code, msg, data: {fields, items}}` with row-major items.
//! Errors are classified into transient and permanent variants so the
//! fetcher's retry loop only retries what can actually recover.

use super::FetchError;
use crate::domain::{Column, RowKey, Table};
use crate::selection::FetchOp;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A source of endpoint tables. Implementations handle transport; the cache
/// and rate-limit layers sit above this trait and providers know nothing
/// about them.
pub trait MarketDataProvider: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Fetch one endpoint table. Must not cache or rate-limit internally.
    fn fetch(&self, op: &FetchOp) -> Result<Table, FetchError>;
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    api_name: &'a str,
    token: &'a str,
    params: &'a std::collections::BTreeMap<String, String>,
    fields: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    msg: Option<String>,
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    fields: Vec<String>,
    items: Vec<Vec<serde_json::Value>>,
}

/// HTTP provider for a tushare-style JSON API.
pub struct HttpProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    token: String,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    /// Map an HTTP status to the error taxonomy.
    fn classify_status(status: reqwest::StatusCode) -> Option<FetchError> {
        if status.is_success() {
            return None;
        }
        Some(match status.as_u16() {
            429 => FetchError::RateLimitExceeded {
                endpoint: String::new(),
            },
            401 | 403 => FetchError::AuthRejected(format!("http status {status}")),
            code if (500..600).contains(&code) => {
                FetchError::ProviderUnavailable(format!("http status {status}"))
            }
            _ => FetchError::MalformedRequest(format!("http status {status}")),
        })
    }

    /// Map an application-level error code to the taxonomy.
    fn classify_api_error(code: i64, msg: &str) -> FetchError {
        let lower = msg.to_lowercase();
        if lower.contains("token") || lower.contains("auth") {
            FetchError::AuthRejected(format!("api code {code}: {msg}"))
        } else if lower.contains("rate") || lower.contains("frequen") {
            FetchError::RateLimitExceeded {
                endpoint: String::new(),
            }
        } else {
            FetchError::MalformedRequest(format!("api code {code}: {msg}"))
        }
    }
}

impl MarketDataProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch(&self, op: &FetchOp) -> Result<Table, FetchError> {
        let request = ApiRequest {
            api_name: &op.endpoint,
            token: &self.token,
            params: &op.params,
            fields: op.fields.join(","),
        };

        let response = self
            .client
            .post(&self.base_url)
            .json(&request)
            .send()
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    FetchError::ProviderUnavailable(e.to_string())
                } else {
                    FetchError::MalformedRequest(e.to_string())
                }
            })?;

        if let Some(mut err) = Self::classify_status(response.status()) {
            if let FetchError::RateLimitExceeded { endpoint } = &mut err {
                *endpoint = op.endpoint.clone();
            }
            return Err(err);
        }

        let body: ApiResponse = response
            .json()
            .map_err(|e| FetchError::ProviderUnavailable(format!("response parse: {e}")))?;

        if body.code != 0 {
            let msg = body.msg.unwrap_or_default();
            let mut err = Self::classify_api_error(body.code, &msg);
            if let FetchError::RateLimitExceeded { endpoint } = &mut err {
                *endpoint = op.endpoint.clone();
            }
            return Err(err);
        }

        let data = body.data.ok_or_else(|| {
            FetchError::ProviderUnavailable("response carried no data".into())
        })?;
        rows_to_table(op, &data.fields, &data.items)
    }
}

/// Build a [`Table`] from row-major provider output.
///
/// Column typing is by field name convention: `ts_code`, `name`, `industry`
/// are strings; fields containing `date` are dates; everything else is
/// numeric. The provisional row keys use the `trade_date` column when the
/// endpoint serves one, otherwise the op's `end_date`/`trade_date` parameter.
pub(crate) fn rows_to_table(
    op: &FetchOp,
    fields: &[String],
    items: &[Vec<serde_json::Value>],
) -> Result<Table, FetchError> {
    let n = items.len();
    let find = |name: &str| fields.iter().position(|f| f == name);

    let fallback_date = op
        .params
        .get("end_date")
        .or_else(|| op.params.get("trade_date"))
        .and_then(|s| parse_date(s));

    // Provisional index: rebuilt by the merge step from the base endpoint.
    let code_pos = find("ts_code");
    let date_pos = find("trade_date");
    let mut index = Vec::with_capacity(n);
    for row in items {
        let ts_code = code_pos
            .and_then(|p| row.get(p))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let date = date_pos
            .and_then(|p| row.get(p))
            .and_then(|v| v.as_str())
            .and_then(parse_date)
            .or(fallback_date)
            .unwrap_or(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
        index.push(RowKey::new(ts_code, date));
    }

    let mut builder = Table::builder(index);
    for (pos, field) in fields.iter().enumerate() {
        let column = if is_string_field(field) {
            Column::Str(
                items
                    .iter()
                    .map(|row| row.get(pos).and_then(|v| v.as_str()).map(str::to_string))
                    .collect(),
            )
        } else if field.contains("date") {
            Column::Date(
                items
                    .iter()
                    .map(|row| row.get(pos).and_then(|v| v.as_str()).and_then(parse_date))
                    .collect(),
            )
        } else {
            Column::Float(
                items
                    .iter()
                    .map(|row| row.get(pos).and_then(value_to_f64))
                    .collect(),
            )
        };
        builder = builder
            .column(field.clone(), column)
            .map_err(|e| FetchError::MalformedRequest(format!("bad response shape: {e}")))?;
    }
    Ok(builder.build())
}

fn is_string_field(field: &str) -> bool {
    matches!(field, "ts_code" | "name" | "industry" | "symbol" | "area" | "market")
}

fn value_to_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::String(s) => s.parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Accepts both `YYYYMMDD` and `YYYY-MM-DD`.
pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}
