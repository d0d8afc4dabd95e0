//! Core domain types shared across the pipeline.
//!
//! - `RowKey`: one element of the output index (security id + date)
//! - `Column` / `Table`: typed rectangular data keyed by the output index
//! - `FactorSeries`: a numeric series aligned to an output index
//!
//! Tables are immutable after construction and shared downstream as
//! `Arc<Table>`, so concurrent factor evaluations never observe mutation.

mod series;
mod table;

pub use series::FactorSeries;
pub use table::{Column, Table, TableBuilder, TableError};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One row of the output index: a (security, date) pair.
///
/// Ordering is lexicographic (security id first, then date), which defines
/// the deterministic tie-break order used by the scorer's ranking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub ts_code: String,
    pub date: NaiveDate,
}

impl RowKey {
    pub fn new(ts_code: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            ts_code: ts_code.into(),
            date,
        }
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ts_code, self.date)
    }
}
