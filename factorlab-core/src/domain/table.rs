//! Typed rectangular tables keyed by the output index.

use super::RowKey;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while constructing a table.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("column '{name}' has {got} values but the index has {expected} rows")]
    LengthMismatch {
        name: String,
        got: usize,
        expected: usize,
    },

    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),
}

/// A typed column. Missing values are explicit `None`s, never sentinel values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Float(Vec<Option<f64>>),
    Str(Vec<Option<String>>),
    Date(Vec<Option<NaiveDate>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Str(v) => v.len(),
            Column::Date(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The float values, if this is a numeric column.
    pub fn as_float(&self) -> Option<&[Option<f64>]> {
        match self {
            Column::Float(v) => Some(v),
            _ => None,
        }
    }

    /// The string values, if this is a string column.
    pub fn as_str(&self) -> Option<&[Option<String>]> {
        match self {
            Column::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Take the subset of this column at the given row positions.
    pub(crate) fn take(&self, positions: &[usize]) -> Column {
        match self {
            Column::Float(v) => Column::Float(positions.iter().map(|&i| v[i]).collect()),
            Column::Str(v) => Column::Str(positions.iter().map(|&i| v[i].clone()).collect()),
            Column::Date(v) => Column::Date(positions.iter().map(|&i| v[i]).collect()),
        }
    }
}

/// A rectangular table: an output index plus named typed columns, all the
/// same length. Built once via [`TableBuilder`] and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    index: Vec<RowKey>,
    columns: BTreeMap<String, Column>,
}

impl Table {
    pub fn builder(index: Vec<RowKey>) -> TableBuilder {
        TableBuilder {
            index,
            columns: BTreeMap::new(),
        }
    }

    /// An empty table with no rows and no columns.
    pub fn empty() -> Self {
        Self {
            index: Vec::new(),
            columns: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[RowKey] {
        &self.index
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Float values of a named column, if it exists and is numeric.
    pub fn float_column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).and_then(Column::as_float)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Row positions whose `ts_code` is in the given set, in index order.
    pub fn positions_for_codes(&self, codes: &std::collections::HashSet<String>) -> Vec<usize> {
        self.index
            .iter()
            .enumerate()
            .filter(|(_, k)| codes.contains(&k.ts_code))
            .map(|(i, _)| i)
            .collect()
    }

    /// A new table restricted to the given row positions.
    pub fn select_rows(&self, positions: &[usize]) -> Table {
        let index = positions.iter().map(|&i| self.index[i].clone()).collect();
        let columns = self
            .columns
            .iter()
            .map(|(name, col)| (name.clone(), col.take(positions)))
            .collect();
        Table { index, columns }
    }
}

/// Builder that validates rectangular shape before producing a [`Table`].
pub struct TableBuilder {
    index: Vec<RowKey>,
    columns: BTreeMap<String, Column>,
}

impl TableBuilder {
    pub fn column(mut self, name: impl Into<String>, col: Column) -> Result<Self, TableError> {
        let name = name.into();
        if col.len() != self.index.len() {
            return Err(TableError::LengthMismatch {
                name,
                got: col.len(),
                expected: self.index.len(),
            });
        }
        if self.columns.contains_key(&name) {
            return Err(TableError::DuplicateColumn(name));
        }
        self.columns.insert(name, col);
        Ok(self)
    }

    pub fn float(self, name: impl Into<String>, values: Vec<Option<f64>>) -> Result<Self, TableError> {
        self.column(name, Column::Float(values))
    }

    pub fn str(self, name: impl Into<String>, values: Vec<Option<String>>) -> Result<Self, TableError> {
        self.column(name, Column::Str(values))
    }

    pub fn build(self) -> Table {
        Table {
            index: self.index,
            columns: self.columns,
        }
    }
}
