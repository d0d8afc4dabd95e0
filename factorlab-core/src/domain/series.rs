//! Numeric series aligned to an output index.

use super::RowKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A numeric series keyed by the output index.
///
/// `index` and `values` always have the same length. Missing values are
/// explicit `None`s; non-finite floats are normalized to `None` at the
/// boundaries that produce them (sandbox, standardizer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSeries {
    pub index: Vec<RowKey>,
    pub values: Vec<Option<f64>>,
}

impl FactorSeries {
    pub fn new(index: Vec<RowKey>, values: Vec<Option<f64>>) -> Self {
        debug_assert_eq!(index.len(), values.len());
        Self { index, values }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }

    /// Reindex this series onto `target`. Every key of `self` must appear in
    /// `target`; target rows absent from `self` become missing. Returns
    /// `None` if `self` contains a key outside the target index.
    pub fn reindex(&self, target: &[RowKey]) -> Option<FactorSeries> {
        let mut by_key: HashMap<&RowKey, Option<f64>> = HashMap::with_capacity(self.len());
        for (key, value) in self.index.iter().zip(&self.values) {
            by_key.insert(key, *value);
        }

        let target_set: std::collections::HashSet<&RowKey> = target.iter().collect();
        if self.index.iter().any(|k| !target_set.contains(k)) {
            return None;
        }

        let values = target
            .iter()
            .map(|key| by_key.get(key).copied().flatten())
            .collect();
        Some(FactorSeries::new(target.to_vec(), values))
    }
}
