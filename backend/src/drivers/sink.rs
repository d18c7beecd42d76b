// 数据持久化适配器
// Row sinks: idempotent upsert of one validated row per (table, bucket)

use crate::error::SinkError;
use crate::types::{FieldValue, TimeBucket, ValidatedRow};
use async_trait::async_trait;
use chrono::FixedOffset;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Persistence capability consumed by the pipeline.
///
/// Implementations must be idempotent on `(table, row.bucket)`.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Insert or update the row, returning the number of affected rows.
    async fn upsert(&self, table: &str, row: &ValidatedRow) -> Result<u64, SinkError>;
}

/// In-memory upsert store, used for dry runs and tests.
///
/// Affected-row counts follow `INSERT .. ON DUPLICATE KEY UPDATE`:
/// 1 for an insert, 2 for a changed update, 0 when nothing changed.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<BTreeMap<(String, TimeBucket), ValidatedRow>>,
    calls: Mutex<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows stored for `table`, oldest bucket first.
    pub fn rows(&self, table: &str) -> Vec<ValidatedRow> {
        self.rows
            .lock()
            .map(|rows| {
                rows.iter()
                    .filter(|((t, _), _)| t == table)
                    .map(|(_, row)| row.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of upsert calls received.
    pub fn calls(&self) -> u64 {
        self.calls.lock().map(|c| *c).unwrap_or_default()
    }
}

#[async_trait]
impl RowSink for MemorySink {
    async fn upsert(&self, table: &str, row: &ValidatedRow) -> Result<u64, SinkError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| SinkError::Rejected("Mutex poisoned".to_string()))?;
        let affected = match rows.insert((table.to_string(), row.bucket), row.clone()) {
            None => 1,
            Some(previous) if previous == *row => 0,
            Some(_) => 2,
        };
        Ok(affected)
    }
}

/// CSV file per table: `<dir>/<table>.csv` with a `fecha,<fields..>` header.
///
/// Absent values are written as empty cells. Files are append-only, so a
/// repeated bucket for the last written row is ignored rather than rewritten.
/// The last bucket of each table is recovered from the file's final record on
/// first use, so a restart inside a bucket does not duplicate it. Upserts to
/// one table are serialised; different tables write independently.
#[derive(Debug)]
pub struct CsvSink {
    dir: PathBuf,
    offset: FixedOffset,
    tables: Mutex<HashMap<String, Arc<AsyncMutex<TableState>>>>,
}

#[derive(Debug, Default)]
struct TableState {
    loaded: bool,
    last_bucket: Option<TimeBucket>,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>, offset: FixedOffset) -> Self {
        Self {
            dir: dir.into(),
            offset,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", table))
    }

    fn table(&self, table: &str) -> Result<Arc<AsyncMutex<TableState>>, SinkError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| SinkError::Rejected("Mutex poisoned".to_string()))?;
        Ok(tables.entry(table.to_string()).or_default().clone())
    }
}

fn last_bucket_in(path: &Path, offset: FixedOffset) -> Result<Option<TimeBucket>, SinkError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let mut last = None;
    for record in reader.records() {
        if let Some(stamp) = record?.get(0) {
            last = TimeBucket::parse_in(stamp, offset).or(last);
        }
    }
    Ok(last)
}

fn append_record(path: &Path, header: &[String], record: &[String]) -> Result<(), SinkError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let is_new = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(header)?;
    }
    writer.write_record(record)?;
    writer.flush()?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, SinkError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SinkError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SinkError::Rejected(format!("Writer task failed: {}", e)))?
}

#[async_trait]
impl RowSink for CsvSink {
    async fn upsert(&self, table: &str, row: &ValidatedRow) -> Result<u64, SinkError> {
        let state = self.table(table)?;
        // Held across check, write and record
        let mut state = state.lock().await;
        let path = self.path_for(table);

        if !state.loaded {
            let (path, offset) = (path.clone(), self.offset);
            state.last_bucket = blocking(move || last_bucket_in(&path, offset)).await?;
            state.loaded = true;
            if let Some(last) = state.last_bucket {
                debug!("{}: resuming after bucket {}", table, last);
            }
        }
        if state.last_bucket == Some(row.bucket) {
            debug!("{}: bucket {} already written", table, row.bucket);
            return Ok(0);
        }

        let header: Vec<String> = std::iter::once("fecha".to_string())
            .chain(row.fields.keys().cloned())
            .collect();
        let record: Vec<String> = std::iter::once(row.bucket.format_in(self.offset))
            .chain(row.fields.values().map(FieldValue::to_string))
            .collect();
        blocking(move || append_record(&path, &header, &record)).await?;

        state.last_bucket = Some(row.bucket);
        Ok(1)
    }
}
