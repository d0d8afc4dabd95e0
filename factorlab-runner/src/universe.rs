//! Universe resolution — which securities a strategy run scores.
//!
//! A filter is resolved against a security-master table (`ts_code`,
//! `name`, `industry`) into a concrete list of entity ids. Code lists can
//! also be loaded from a one-column CSV file.

use factorlab_core::domain::Table;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("failed to read universe CSV '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("universe CSV has no 'ts_code' column")]
    MissingCodeColumn,

    #[error("security master has no '{0}' column")]
    MissingMasterColumn(String),

    #[error("universe filter matched no securities")]
    EmptyUniverse,
}

/// Which securities a run covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UniverseFilter {
    /// Every security in the master table.
    All,
    /// An explicit code list.
    TsCodes { codes: Vec<String> },
    /// Every security in one industry.
    Industry { industry: String },
}

impl UniverseFilter {
    /// Resolve the filter against a security-master table into a sorted,
    /// deduplicated code list.
    pub fn resolve(&self, master: &Table) -> Result<Vec<String>, UniverseError> {
        let codes = match self {
            UniverseFilter::All => master_column(master, "ts_code")?,
            UniverseFilter::TsCodes { codes } => {
                let known: BTreeSet<String> =
                    master_column(master, "ts_code")?.into_iter().collect();
                codes
                    .iter()
                    .filter(|c| known.contains(*c))
                    .cloned()
                    .collect()
            }
            UniverseFilter::Industry { industry } => {
                let all_codes = master_column(master, "ts_code")?;
                let industries = master
                    .column("industry")
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| UniverseError::MissingMasterColumn("industry".into()))?;
                all_codes
                    .into_iter()
                    .zip(industries)
                    .filter(|(_, ind)| ind.as_deref() == Some(industry.as_str()))
                    .map(|(code, _)| code)
                    .collect()
            }
        };

        let unique: BTreeSet<String> = codes.into_iter().collect();
        if unique.is_empty() {
            return Err(UniverseError::EmptyUniverse);
        }
        Ok(unique.into_iter().collect())
    }

    /// Load an explicit code list from a CSV file with a `ts_code` column.
    pub fn from_csv(path: &Path) -> Result<Self, UniverseError> {
        let mut reader = csv::Reader::from_path(path).map_err(|source| UniverseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let code_col = reader
            .headers()
            .map_err(|source| UniverseError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .iter()
            .position(|h| h == "ts_code")
            .ok_or(UniverseError::MissingCodeColumn)?;

        let mut codes = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|source| UniverseError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if let Some(code) = record.get(code_col) {
                if !code.trim().is_empty() {
                    codes.push(code.trim().to_string());
                }
            }
        }
        Ok(UniverseFilter::TsCodes { codes })
    }
}

fn master_column(master: &Table, name: &str) -> Result<Vec<String>, UniverseError> {
    let column = master
        .column(name)
        .and_then(|c| c.as_str())
        .ok_or_else(|| UniverseError::MissingMasterColumn(name.into()))?;
    Ok(column.iter().flatten().cloned().collect())
}
