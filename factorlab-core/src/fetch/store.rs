//! Parquet disk tier for fetched endpoint tables.
//!
//! Layout: `{dir}/{cache_key}.parquet` plus a `{cache_key}.meta.json`
//! sidecar recording the endpoint, row count, content hash, and storage
//! time. Writes are atomic (tmp + rename); corrupt files are quarantined
//! (renamed to `.quarantined`), never deleted. The sidecar's `stored_at`
//! enforces the same TTL as the in-memory cache.

use super::FetchError;
use crate::domain::{Column, RowKey, Table};
use crate::selection::CacheKey;
use chrono::NaiveDate;
use polars::prelude::{Column as PlColumn, DataFrame, DataType, ParquetReader, ParquetWriter, SerReader};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const KEY_CODE_COL: &str = "__key_ts_code";
const KEY_DATE_COL: &str = "__key_date";

/// Metadata sidecar for one stored table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub cache_key: String,
    pub endpoint: String,
    pub rows: usize,
    pub data_hash: String,
    pub stored_at: chrono::NaiveDateTime,
}

/// The Parquet store.
pub struct TableStore {
    dir: PathBuf,
}

impl TableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn parquet_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.parquet"))
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.meta.json"))
    }

    /// Persist a fetched table under its cache key.
    pub fn save(&self, key: &CacheKey, endpoint: &str, table: &Table) -> Result<(), FetchError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| FetchError::StoreError(format!("create dir: {e}")))?;

        let df = table_to_dataframe(table)?;
        let path = self.parquet_path(key);
        let tmp_path = path.with_extension("parquet.tmp");
        write_parquet(&df, &tmp_path)?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            FetchError::StoreError(format!("atomic rename failed: {e}"))
        })?;

        let meta = StoreMeta {
            cache_key: key.0.clone(),
            endpoint: endpoint.to_string(),
            rows: table.len(),
            data_hash: blake3::hash(
                &serde_json::to_vec(table)
                    .map_err(|e| FetchError::StoreError(format!("hash serialization: {e}")))?,
            )
            .to_hex()
            .to_string(),
            stored_at: chrono::Utc::now().naive_utc(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| FetchError::StoreError(format!("meta serialization: {e}")))?;
        fs::write(self.meta_path(key), meta_json)
            .map_err(|e| FetchError::StoreError(format!("meta write: {e}")))?;
        Ok(())
    }

    /// Load a table if present and fresh. Stale or missing entries return
    /// `None`; corrupt files are quarantined and also return `None`.
    pub fn load(&self, key: &CacheKey, ttl: Duration) -> Option<Table> {
        let meta = self.meta(key)?;
        let age = chrono::Utc::now().naive_utc() - meta.stored_at;
        if age > chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX) {
            return None;
        }

        let path = self.parquet_path(key);
        match load_parquet(&path) {
            Ok(table) => Some(table),
            Err(e) => {
                let quarantine = path.with_extension("parquet.quarantined");
                tracing::warn!(path = %path.display(), error = %e, "quarantining corrupt store file");
                let _ = fs::rename(&path, &quarantine);
                None
            }
        }
    }

    pub fn meta(&self, key: &CacheKey) -> Option<StoreMeta> {
        let content = fs::read_to_string(self.meta_path(key)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

const EPOCH: fn() -> NaiveDate = || NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();

fn date_to_days(date: NaiveDate) -> i32 {
    (date - EPOCH()).num_days() as i32
}

fn days_to_date(days: i32) -> NaiveDate {
    EPOCH() + chrono::Duration::days(i64::from(days))
}

fn table_to_dataframe(table: &Table) -> Result<DataFrame, FetchError> {
    let codes: Vec<String> = table.index().iter().map(|k| k.ts_code.clone()).collect();
    let dates: Vec<i32> = table.index().iter().map(|k| date_to_days(k.date)).collect();

    let mut columns = vec![
        PlColumn::new(KEY_CODE_COL.into(), codes),
        PlColumn::new(KEY_DATE_COL.into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| FetchError::StoreError(format!("key date cast: {e}")))?,
    ];

    for (name, col) in table.columns() {
        let pl_col = match col {
            Column::Float(v) => PlColumn::new(name.into(), v.clone()),
            Column::Str(v) => PlColumn::new(name.into(), v.clone()),
            Column::Date(v) => {
                let days: Vec<Option<i32>> = v.iter().map(|d| d.map(date_to_days)).collect();
                PlColumn::new(name.into(), days)
                    .cast(&DataType::Date)
                    .map_err(|e| FetchError::StoreError(format!("date cast '{name}': {e}")))?
            }
        };
        columns.push(pl_col);
    }

    DataFrame::new(columns).map_err(|e| FetchError::StoreError(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), FetchError> {
    let file =
        fs::File::create(path).map_err(|e| FetchError::StoreError(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| FetchError::StoreError(format!("write parquet: {e}")))?;
    Ok(())
}

fn load_parquet(path: &Path) -> Result<Table, FetchError> {
    let file = fs::File::open(path).map_err(|e| FetchError::StoreError(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| FetchError::StoreError(format!("read: {e}")))?;
    dataframe_to_table(&df)
}

fn dataframe_to_table(df: &DataFrame) -> Result<Table, FetchError> {
    let n = df.height();
    let read_err = |name: &str, e: polars::prelude::PolarsError| {
        FetchError::StoreError(format!("column '{name}': {e}"))
    };

    let code_ca = df
        .column(KEY_CODE_COL)
        .map_err(|e| read_err(KEY_CODE_COL, e))?
        .str()
        .map_err(|e| read_err(KEY_CODE_COL, e))?
        .clone();
    let date_ca = df
        .column(KEY_DATE_COL)
        .map_err(|e| read_err(KEY_DATE_COL, e))?
        .date()
        .map_err(|e| read_err(KEY_DATE_COL, e))?
        .clone();

    let mut index = Vec::with_capacity(n);
    for i in 0..n {
        let code = code_ca
            .get(i)
            .ok_or_else(|| FetchError::StoreError(format!("null key code at row {i}")))?;
        let days = date_ca
            .get(i)
            .ok_or_else(|| FetchError::StoreError(format!("null key date at row {i}")))?;
        index.push(RowKey::new(code, days_to_date(days)));
    }

    let mut builder = Table::builder(index);
    for pl_col in df.get_columns() {
        let name = pl_col.name().as_str();
        if name == KEY_CODE_COL || name == KEY_DATE_COL {
            continue;
        }
        let column = match pl_col.dtype() {
            DataType::Float64 => {
                let ca = pl_col.f64().map_err(|e| read_err(name, e))?;
                Column::Float((0..n).map(|i| ca.get(i)).collect())
            }
            DataType::String => {
                let ca = pl_col.str().map_err(|e| read_err(name, e))?;
                Column::Str((0..n).map(|i| ca.get(i).map(str::to_string)).collect())
            }
            DataType::Date => {
                let ca = pl_col.date().map_err(|e| read_err(name, e))?;
                Column::Date((0..n).map(|i| ca.get(i).map(days_to_date)).collect())
            }
            other => {
                return Err(FetchError::StoreError(format!(
                    "unsupported stored dtype {other:?} in column '{name}'"
                )))
            }
        };
        builder = builder
            .column(name, column)
            .map_err(|e| FetchError::StoreError(format!("rebuild: {e}")))?;
    }
    Ok(builder.build())
}
