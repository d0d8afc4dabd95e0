//! Synthetic fallback tables for degraded/demo mode.
//!
//! When every retry is exhausted (or in offline mode), the fetcher
//! substitutes a synthetic table with the same shape the real fetch would
//! have had. Values come from a BLAKE3-seeded `StdRng`, so the same fetch
//! op always produces the same synthetic data regardless of which thread
//! generates it.

use super::provider::{parse_date, MarketDataProvider};
use super::FetchError;
use crate::domain::{Column, RowKey, Table};
use crate::selection::FetchOp;
use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Default demo universe used when the op names no securities.
const DEMO_CODES: [&str; 6] = [
    "000001.SZ",
    "000002.SZ",
    "000063.SZ",
    "600000.SH",
    "600036.SH",
    "601318.SH",
];

const INDUSTRIES: [&str; 4] = ["bank", "tech", "energy", "consumer"];

/// Derive a deterministic seed for an op from its cache key.
fn seed_for(op: &FetchOp) -> u64 {
    let hash = blake3::hash(op.cache_key.0.as_bytes());
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().unwrap())
}

fn business_dates(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut day = start;
    while day <= end {
        use chrono::Datelike;
        if day.weekday().num_days_from_monday() < 5 {
            dates.push(day);
        }
        day += chrono::Duration::days(1);
    }
    dates
}

/// Build a synthetic table matching the shape of `op`.
///
/// Securities come from the op's `ts_code` parameter (comma-separated) or a
/// demo universe; dates span the op's `start_date..=end_date` business days
/// (a single day when absent). Numeric fields get a per-(code, field) base
/// level with per-date noise; the `pct_chg` field stays in percent range.
pub fn synthetic_provider_table(op: &FetchOp) -> Table {
    let codes: Vec<String> = op
        .params
        .get("ts_code")
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| DEMO_CODES.iter().map(|s| s.to_string()).collect());

    let end = op
        .params
        .get("end_date")
        .or_else(|| op.params.get("trade_date"))
        .and_then(|s| parse_date(s))
        .unwrap_or(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
    let start = op
        .params
        .get("start_date")
        .and_then(|s| parse_date(s))
        .unwrap_or(end);

    let dated = op.fields.iter().any(|f| f == "trade_date");
    let dates = if dated {
        business_dates(start, end)
    } else {
        vec![end]
    };

    let mut rng = StdRng::seed_from_u64(seed_for(op));
    let mut index = Vec::with_capacity(codes.len() * dates.len());
    for code in &codes {
        for date in &dates {
            index.push(RowKey::new(code.clone(), *date));
        }
    }

    let mut builder = Table::builder(index.clone());
    for field in &op.fields {
        let column = match field.as_str() {
            "ts_code" => Column::Str(index.iter().map(|k| Some(k.ts_code.clone())).collect()),
            "trade_date" => Column::Date(index.iter().map(|k| Some(k.date)).collect()),
            "name" => Column::Str(index.iter().map(|k| Some(k.ts_code.clone())).collect()),
            "industry" => Column::Str(
                index
                    .iter()
                    .map(|_| Some(INDUSTRIES[rng.gen_range(0..INDUSTRIES.len())].to_string()))
                    .collect(),
            ),
            "list_date" => Column::Date(
                index
                    .iter()
                    .map(|_| NaiveDate::from_ymd_opt(2010, 1, rng.gen_range(1..=28)))
                    .collect(),
            ),
            "pct_chg" => Column::Float(
                index.iter().map(|_| Some(rng.gen_range(-5.0..5.0))).collect(),
            ),
            _ => {
                // Per-code base level so the cross-section has structure,
                // plus per-row noise.
                let bases: Vec<f64> = codes.iter().map(|_| rng.gen_range(5.0..200.0)).collect();
                let values = index
                    .iter()
                    .map(|key| {
                        let code_pos = codes.iter().position(|c| c == &key.ts_code).unwrap_or(0);
                        let noise = rng.gen_range(-0.05..0.05);
                        Some(bases[code_pos] * (1.0 + noise))
                    })
                    .collect();
                Column::Float(values)
            }
        };
        // Field lists are deduplicated at resolution time, so this cannot fail.
        builder = builder.column(field.clone(), column).expect("synthetic shape");
    }
    builder.build()
}

/// Provider that always serves synthetic data. Used by offline/demo mode
/// and by tests.
pub struct SyntheticProvider;

impl MarketDataProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn fetch(&self, op: &FetchOp) -> Result<Table, FetchError> {
        Ok(synthetic_provider_table(op))
    }
}
