//! Parquet-backed store with Hive-style partitioning per entity.
//!
//! Layout (one store per collection):
//! `{root}/entity={ID}/data.parquet` plus a `meta.json` sidecar.
//! Staged refreshes live in `{root}/entity={ID}/.stage-{STAGE}/part-{n}.parquet`.
//!
//! Features:
//! - Atomic writes (write to .tmp, rename into place)
//! - Staged full refresh swapped in with a single rename
//! - Per-partition async locks; readers never block on writers
//! - Quarantine for corrupt files ({filename}.quarantined)
//! - BLAKE3 content hash in the metadata sidecar

use super::{merge_upsert, RecordFilter, RecordQuery, StageId, StoreError, TimeSeriesStore};
use crate::domain::{NaturalKey, TimeSeriesRecord, UpsertOutcome};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use dashmap::DashMap;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DATA_FILE: &str = "data.parquet";
const META_FILE: &str = "meta.json";
const STAGE_PREFIX: &str = ".stage-";
const PARTITION_PREFIX: &str = "entity=";
const FIELD_PREFIX: &str = "field.";

/// Metadata sidecar for one entity partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub entity_id: String,
    pub row_count: usize,
    pub first_timestamp: Option<NaiveDateTime>,
    pub last_timestamp: Option<NaiveDateTime>,
    pub data_hash: String,
    pub written_at: NaiveDateTime,
}

pub struct ParquetStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    /// Root directory of this collection.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one entity: `{root}/entity={ID}/`
    fn partition_dir(&self, entity_id: &str) -> PathBuf {
        self.root.join(partition_name(entity_id))
    }

    fn stage_dir(&self, entity_id: &str, stage: &StageId) -> PathBuf {
        self.partition_dir(entity_id)
            .join(format!("{STAGE_PREFIX}{stage}"))
    }

    fn lock_for(&self, entity_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(entity_id.to_string()).or_default().clone()
    }

    /// Metadata sidecar of an entity, if it has been written.
    pub fn get_meta(&self, entity_id: &str) -> Option<PartitionMeta> {
        let content = fs::read_to_string(self.partition_dir(entity_id).join(META_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn partitions_for(&self, filter: &RecordFilter) -> Result<Vec<PathBuf>, StoreError> {
        match filter.candidate_entities() {
            Some(ids) => Ok(ids.iter().map(|id| self.partition_dir(id)).collect()),
            None => list_partitions(&self.root),
        }
    }
}

/// Run blocking filesystem work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl TimeSeriesStore for ParquetStore {
    /// Create the root and clear leftovers of interrupted writes.
    async fn bootstrap(&self) -> Result<(), StoreError> {
        let root = self.root.clone();
        blocking(move || {
            fs::create_dir_all(&root).map_err(|e| StoreError::Io(format!("create root: {e}")))?;
            for dir in list_partitions(&root)? {
                let entries =
                    fs::read_dir(&dir).map_err(|e| StoreError::Io(format!("read dir: {e}")))?;
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with(STAGE_PREFIX) {
                        warn!(path = %path.display(), "removing abandoned staged refresh");
                        let _ = fs::remove_dir_all(&path);
                    } else if name.ends_with(".tmp") {
                        let _ = fs::remove_file(&path);
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn upsert(
        &self,
        record: TimeSeriesRecord,
        now: NaiveDateTime,
    ) -> Result<UpsertOutcome, StoreError> {
        let outcomes = self.upsert_batch(vec![record], now).await?;
        outcomes
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Unavailable("upsert produced no outcome".into()))
    }

    /// Groups by entity so each partition is rewritten once per batch.
    async fn upsert_batch(
        &self,
        records: Vec<TimeSeriesRecord>,
        now: NaiveDateTime,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let total = records.len();
        let mut groups: BTreeMap<String, Vec<(usize, TimeSeriesRecord)>> = BTreeMap::new();
        for (i, record) in records.into_iter().enumerate() {
            groups
                .entry(record.entity_id.clone())
                .or_default()
                .push((i, record));
        }

        let mut outcomes = vec![UpsertOutcome::Unchanged; total];
        for (entity_id, items) in groups {
            let lock = self.lock_for(&entity_id);
            let _guard = lock.lock().await;
            let dir = self.partition_dir(&entity_id);
            let results = blocking(move || {
                let mut rows: BTreeMap<NaturalKey, TimeSeriesRecord> = read_partition(&dir)?
                    .into_iter()
                    .map(|r| (r.natural_key(), r))
                    .collect();
                let mut results = Vec::with_capacity(items.len());
                for (i, record) in items {
                    let key = record.natural_key();
                    let (merged, outcome) = merge_upsert(rows.get(&key), record, now);
                    rows.insert(key, merged);
                    results.push((i, outcome));
                }
                write_partition(&dir, &rows.into_values().collect::<Vec<_>>())?;
                Ok(results)
            })
            .await?;
            for (i, outcome) in results {
                outcomes[i] = outcome;
            }
        }
        Ok(outcomes)
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<TimeSeriesRecord>, StoreError> {
        let dirs = self.partitions_for(&query.filter)?;
        let query = query.clone();
        blocking(move || {
            let mut candidates = Vec::new();
            for dir in dirs {
                candidates.extend(read_partition(&dir)?);
            }
            Ok(query.apply(candidates))
        })
        .await
    }

    async fn count(&self, filter: &RecordFilter) -> Result<usize, StoreError> {
        Ok(self.find(&RecordQuery::new(filter.clone())).await?.len())
    }

    async fn stage(
        &self,
        entity_id: &str,
        stage: &StageId,
        batch: Vec<TimeSeriesRecord>,
    ) -> Result<(), StoreError> {
        if let Some(foreign) = batch.iter().find(|r| r.entity_id != entity_id) {
            return Err(StoreError::ForeignStagedRecord {
                entity_id: entity_id.to_string(),
                found: foreign.entity_id.clone(),
            });
        }
        let lock = self.lock_for(entity_id);
        let _guard = lock.lock().await;
        let dir = self.stage_dir(entity_id, stage);
        blocking(move || {
            fs::create_dir_all(&dir).map_err(|e| StoreError::Io(format!("create stage dir: {e}")))?;
            let part = fs::read_dir(&dir)
                .map_err(|e| StoreError::Io(format!("read stage dir: {e}")))?
                .count();
            if batch.is_empty() {
                return Ok(());
            }
            let df = records_to_dataframe(&batch)?;
            write_atomic(&df, &dir.join(format!("part-{part:05}.parquet")))
        })
        .await
    }

    async fn commit_stage(&self, entity_id: &str, stage: &StageId) -> Result<usize, StoreError> {
        let lock = self.lock_for(entity_id);
        let _guard = lock.lock().await;
        let dir = self.partition_dir(entity_id);
        let stage_dir = self.stage_dir(entity_id, stage);
        let (entity, stage_name) = (entity_id.to_string(), stage.to_string());
        let committed = blocking(move || {
            if !stage_dir.is_dir() {
                return Err(StoreError::StageNotFound {
                    entity_id: entity,
                    stage: stage_name,
                });
            }
            let mut rows: BTreeMap<NaturalKey, TimeSeriesRecord> = BTreeMap::new();
            let mut parts: Vec<PathBuf> = fs::read_dir(&stage_dir)
                .map_err(|e| StoreError::Io(format!("read stage dir: {e}")))?
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("parquet"))
                .collect();
            parts.sort();
            for part in parts {
                for record in load_parquet(&part)? {
                    rows.insert(record.natural_key(), record);
                }
            }
            let records: Vec<TimeSeriesRecord> = rows.into_values().collect();
            write_partition(&dir, &records)?;
            let _ = fs::remove_dir_all(&stage_dir);
            Ok(records.len())
        })
        .await?;
        debug!(entity_id, stage = %stage, committed, "staged refresh committed");
        Ok(committed)
    }

    async fn discard_stage(&self, entity_id: &str, stage: &StageId) -> Result<(), StoreError> {
        let lock = self.lock_for(entity_id);
        let _guard = lock.lock().await;
        let stage_dir = self.stage_dir(entity_id, stage);
        blocking(move || {
            if stage_dir.exists() {
                fs::remove_dir_all(&stage_dir)
                    .map_err(|e| StoreError::Io(format!("remove stage dir: {e}")))?;
            }
            Ok(())
        })
        .await
    }
}

// ── Partition helpers ───────────────────────────────────────────────

/// `entity={ID}` with path separators escaped.
fn partition_name(entity_id: &str) -> String {
    let escaped = entity_id
        .replace('%', "%25")
        .replace('/', "%2F")
        .replace('\\', "%5C");
    format!("{PARTITION_PREFIX}{escaped}")
}

fn list_partitions(root: &Path) -> Result<Vec<PathBuf>, StoreError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(root).map_err(|e| StoreError::Io(format!("read root: {e}")))?;
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(PARTITION_PREFIX))
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// Load one partition. Missing → empty; corrupt → quarantined, then empty.
fn read_partition(dir: &Path) -> Result<Vec<TimeSeriesRecord>, StoreError> {
    let path = dir.join(DATA_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    match load_parquet(&path) {
        Ok(records) => Ok(records),
        Err(e) => {
            let quarantine = path.with_extension("parquet.quarantined");
            warn!(path = %path.display(), error = %e, "quarantining corrupt partition");
            let _ = fs::rename(&path, &quarantine);
            Ok(Vec::new())
        }
    }
}

/// Replace a partition's rows. An empty set removes the data file.
fn write_partition(dir: &Path, records: &[TimeSeriesRecord]) -> Result<(), StoreError> {
    let path = dir.join(DATA_FILE);
    if records.is_empty() {
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StoreError::Io(format!("remove partition: {e}")))?;
        }
        let _ = fs::remove_file(dir.join(META_FILE));
        return Ok(());
    }

    fs::create_dir_all(dir).map_err(|e| StoreError::Io(format!("create partition dir: {e}")))?;
    let df = records_to_dataframe(records)?;
    write_atomic(&df, &path)?;

    let meta = PartitionMeta {
        entity_id: records[0].entity_id.clone(),
        row_count: records.len(),
        first_timestamp: records.iter().map(|r| r.timestamp).min(),
        last_timestamp: records.iter().map(|r| r.timestamp).max(),
        data_hash: blake3::hash(
            &serde_json::to_vec(records)
                .map_err(|e| StoreError::Serialization(format!("hash serialization: {e}")))?,
        )
        .to_hex()
        .to_string(),
        written_at: chrono::Utc::now().naive_utc(),
    };
    let meta_json = serde_json::to_string_pretty(&meta)
        .map_err(|e| StoreError::Serialization(format!("meta serialization: {e}")))?;
    fs::write(dir.join(META_FILE), meta_json)
        .map_err(|e| StoreError::Io(format!("meta write: {e}")))?;
    Ok(())
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn polars_err(context: &'static str) -> impl Fn(PolarsError) -> StoreError {
    move |e| StoreError::Parquet(format!("{context}: {e}"))
}

fn json_err(context: &'static str) -> impl Fn(serde_json::Error) -> StoreError {
    move |e| StoreError::Serialization(format!("{context}: {e}"))
}

fn datetime_column(name: &str, values: Vec<Option<NaiveDateTime>>) -> Result<Column, StoreError> {
    let millis: Vec<Option<i64>> = values
        .into_iter()
        .map(|v| v.map(|ts| ts.and_utc().timestamp_millis()))
        .collect();
    Column::new(name.into(), millis)
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
        .map_err(polars_err("datetime cast"))
}

/// Convert records to a DataFrame. Every numeric field gets its own
/// nullable `field.{name}` column.
fn records_to_dataframe(records: &[TimeSeriesRecord]) -> Result<DataFrame, StoreError> {
    let strings = |f: fn(&TimeSeriesRecord) -> String| -> Vec<String> { records.iter().map(f).collect() };

    let mut tags = Vec::with_capacity(records.len());
    let mut payloads = Vec::with_capacity(records.len());
    for r in records {
        tags.push(serde_json::to_string(&r.tags).map_err(json_err("tags"))?);
        payloads.push(serde_json::to_string(&r.payload).map_err(json_err("payload"))?);
    }

    let mut columns = vec![
        Column::new("entity_id".into(), strings(|r| r.entity_id.clone())),
        Column::new("metric_key".into(), strings(|r| r.metric_key.clone())),
        Column::new("granularity".into(), strings(|r| r.granularity.clone())),
        datetime_column("timestamp", records.iter().map(|r| Some(r.timestamp)).collect())?,
        Column::new("provider".into(), strings(|r| r.provider.clone())),
        Column::new("tags".into(), tags),
        Column::new("payload".into(), payloads),
        datetime_column("created_at", records.iter().map(|r| r.created_at).collect())?,
        datetime_column("updated_at", records.iter().map(|r| r.updated_at).collect())?,
        datetime_column("ingested_at", records.iter().map(|r| r.ingested_at).collect())?,
    ];

    let field_names: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .collect();
    for name in field_names {
        let values: Vec<Option<f64>> = records.iter().map(|r| r.field(name)).collect();
        columns.push(Column::new(format!("{FIELD_PREFIX}{name}").into(), values));
    }

    DataFrame::new(columns).map_err(polars_err("dataframe creation"))
}

fn write_atomic(df: &DataFrame, path: &Path) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp_path).map_err(|e| StoreError::Io(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(polars_err("write parquet"))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::Io(format!("atomic rename failed: {e}"))
    })
}

const EXPECTED_COLUMNS: [&str; 10] = [
    "entity_id",
    "metric_key",
    "granularity",
    "timestamp",
    "provider",
    "tags",
    "payload",
    "created_at",
    "updated_at",
    "ingested_at",
];

/// Load a Parquet file and validate its schema.
fn load_parquet(path: &Path) -> Result<Vec<TimeSeriesRecord>, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::Io(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(polars_err("read parquet"))?;
    for name in EXPECTED_COLUMNS {
        if df.column(name).is_err() {
            return Err(StoreError::Parquet(format!("missing column '{name}'")));
        }
    }
    dataframe_to_records(&df)
}

fn string_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, StoreError> {
    let column = df.column(name).map_err(polars_err("column read"))?;
    let ca = column.str().map_err(polars_err("string column type"))?;
    Ok(ca.into_iter().map(|v| v.map(str::to_string)).collect())
}

fn datetime_values(df: &DataFrame, name: &str) -> Result<Vec<Option<NaiveDateTime>>, StoreError> {
    let column = df
        .column(name)
        .map_err(polars_err("column read"))?
        .cast(&DataType::Int64)
        .map_err(polars_err("datetime column type"))?;
    let ca = column.i64().map_err(polars_err("datetime column type"))?;
    Ok(ca
        .into_iter()
        .map(|v| v.and_then(DateTime::from_timestamp_millis).map(|dt| dt.naive_utc()))
        .collect())
}

/// Convert a DataFrame back to records.
fn dataframe_to_records(df: &DataFrame) -> Result<Vec<TimeSeriesRecord>, StoreError> {
    let entity_ids = string_values(df, "entity_id")?;
    let metric_keys = string_values(df, "metric_key")?;
    let granularities = string_values(df, "granularity")?;
    let timestamps = datetime_values(df, "timestamp")?;
    let providers = string_values(df, "provider")?;
    let tags = string_values(df, "tags")?;
    let payloads = string_values(df, "payload")?;
    let created = datetime_values(df, "created_at")?;
    let updated = datetime_values(df, "updated_at")?;
    let ingested = datetime_values(df, "ingested_at")?;

    let mut fields: Vec<(String, Vec<Option<f64>>)> = Vec::new();
    for column in df.get_columns() {
        let Some(name) = column.name().as_str().strip_prefix(FIELD_PREFIX) else {
            continue;
        };
        let cast = column
            .cast(&DataType::Float64)
            .map_err(polars_err("field column type"))?;
        let values = cast
            .f64()
            .map_err(polars_err("field column type"))?
            .into_iter()
            .collect();
        fields.push((name.to_string(), values));
    }

    let n = df.height();
    let mut records = Vec::with_capacity(n);
    for i in 0..n {
        let timestamp = timestamps[i]
            .ok_or_else(|| StoreError::Parquet(format!("null timestamp at row {i}")))?;
        let mut record = TimeSeriesRecord::new(
            entity_ids[i].clone().unwrap_or_default(),
            metric_keys[i].clone().unwrap_or_default(),
            granularities[i].clone().unwrap_or_default(),
            timestamp,
        );
        record.provider = providers[i].clone().unwrap_or_default();
        if let Some(raw) = &tags[i] {
            record.tags = serde_json::from_str(raw).map_err(json_err("tags"))?;
        }
        if let Some(raw) = &payloads[i] {
            record.payload = serde_json::from_str(raw).map_err(json_err("payload"))?;
        }
        for (name, values) in &fields {
            record.fields.insert(name.clone(), values[i]);
        }
        record.created_at = created[i];
        record.updated_at = updated[i];
        record.ingested_at = ingested[i];
        records.push(record);
    }
    Ok(records)
}
