//! Storage abstraction for time-series records.
//!
//! One `TimeSeriesStore` backs one logical collection (a `(dataset, target)`
//! pair, see `sink`). Two backends implement it:
//! - `memory::MemoryStore`: embedded ordered table
//! - `parquet::ParquetStore`: Hive-partitioned Parquet files per entity
//!
//! Full refreshes go through staging: rows are written under a fresh
//! `StageId`, then `commit_stage` swaps the entity's rows in one step. A reader
//! sees either the old history or the new one, never an empty entity.

pub mod memory;
pub mod parquet;
pub mod sink;

use crate::domain::{TimeSeriesRecord, UpsertOutcome};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub use memory::MemoryStore;
pub use parquet::ParquetStore;
pub use sink::{SinkDescription, SinkHandle, SinkRegistry, SinkRegistryBuilder, SinkResolver};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no staged refresh '{stage}' for entity '{entity_id}'")]
    StageNotFound { entity_id: String, stage: String },

    #[error("staged record for '{found}' does not belong to entity '{entity_id}'")]
    ForeignStagedRecord { entity_id: String, found: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Identifies one staged full refresh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(String);

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

impl StageId {
    /// A process-unique id: pid, wall-clock nanos and a counter.
    pub fn generate() -> Self {
        let n = STAGE_COUNTER.fetch_add(1, Ordering::SeqCst);
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self(format!("{:x}-{:x}-{n}", std::process::id(), nanos))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Conjunction of optional predicates over stored records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub entity_id: Option<String>,
    pub entity_in: Option<Vec<String>>,
    pub metric_key: Option<String>,
    pub granularity: Option<String>,
    pub timestamp_gte: Option<NaiveDateTime>,
    pub timestamp_lte: Option<NaiveDateTime>,
    /// Matches when the record carries at least one of these tags.
    pub tags_any: Vec<String>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Self::default()
        }
    }

    pub fn entity_in(mut self, ids: Vec<String>) -> Self {
        self.entity_in = Some(ids);
        self
    }

    pub fn metric_key(mut self, key: impl Into<String>) -> Self {
        self.metric_key = Some(key.into());
        self
    }

    pub fn granularity(mut self, granularity: impl Into<String>) -> Self {
        self.granularity = Some(granularity.into());
        self
    }

    pub fn since(mut self, ts: Option<NaiveDateTime>) -> Self {
        self.timestamp_gte = ts;
        self
    }

    pub fn until(mut self, ts: Option<NaiveDateTime>) -> Self {
        self.timestamp_lte = ts;
        self
    }

    pub fn tags_any(mut self, tags: Vec<String>) -> Self {
        self.tags_any = tags;
        self
    }

    /// Entities this filter can possibly match; `None` means any.
    pub fn candidate_entities(&self) -> Option<Vec<String>> {
        match (&self.entity_id, &self.entity_in) {
            (Some(id), Some(ids)) => Some(ids.iter().filter(|i| *i == id).cloned().collect()),
            (Some(id), None) => Some(vec![id.clone()]),
            (None, Some(ids)) => Some(ids.clone()),
            (None, None) => None,
        }
    }

    pub fn matches(&self, record: &TimeSeriesRecord) -> bool {
        if let Some(id) = &self.entity_id {
            if &record.entity_id != id {
                return false;
            }
        }
        if let Some(ids) = &self.entity_in {
            if !ids.iter().any(|i| i == &record.entity_id) {
                return false;
            }
        }
        if let Some(key) = &self.metric_key {
            if &record.metric_key != key {
                return false;
            }
        }
        if let Some(g) = &self.granularity {
            if &record.granularity != g {
                return false;
            }
        }
        if let Some(from) = self.timestamp_gte {
            if record.timestamp < from {
                return false;
            }
        }
        if let Some(until) = self.timestamp_lte {
            if record.timestamp > until {
                return false;
            }
        }
        if !self.tags_any.is_empty() && !self.tags_any.iter().any(|t| record.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// Filter + single-key sort on timestamp + skip + limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    pub filter: RecordFilter,
    pub order: SortOrder,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn new(filter: RecordFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Run the query over an unordered candidate set.
    ///
    /// Ties on timestamp fall back to the natural key so results are stable.
    pub fn apply<I>(&self, records: I) -> Vec<TimeSeriesRecord>
    where
        I: IntoIterator<Item = TimeSeriesRecord>,
    {
        let mut hits: Vec<TimeSeriesRecord> = records
            .into_iter()
            .filter(|r| self.filter.matches(r))
            .collect();
        hits.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.natural_key().cmp(&b.natural_key()))
        });
        if self.order == SortOrder::Descending {
            hits.reverse();
        }
        let page = hits.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        }
    }
}

/// Merge an incoming write with the stored record for the same key.
///
/// `created_at` is set only when the key is new; `updated_at` is always
/// refreshed; `ingested_at` keeps the caller's value or falls back to `now`.
pub fn merge_upsert(
    existing: Option<&TimeSeriesRecord>,
    mut incoming: TimeSeriesRecord,
    now: NaiveDateTime,
) -> (TimeSeriesRecord, UpsertOutcome) {
    match existing {
        None => {
            incoming.created_at = Some(now);
            incoming.updated_at = Some(now);
            incoming.ingested_at = incoming.ingested_at.or(Some(now));
            (incoming, UpsertOutcome::Inserted)
        }
        Some(stored) => {
            let mut merged = stored.overlay(incoming);
            merged.created_at = stored.created_at.or(Some(now));
            merged.updated_at = Some(now);
            merged.ingested_at = merged.ingested_at.or(Some(now));
            let outcome = if merged.same_content(stored) {
                UpsertOutcome::Unchanged
            } else {
                UpsertOutcome::Updated
            };
            (merged, outcome)
        }
    }
}

/// Stamp bookkeeping timestamps on rows written by a full refresh.
pub fn stamp_fresh(records: &mut [TimeSeriesRecord], now: NaiveDateTime) {
    for record in records {
        record.created_at = Some(now);
        record.updated_at = Some(now);
        record.ingested_at = record.ingested_at.or(Some(now));
    }
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// One-time setup before the store serves requests.
    async fn bootstrap(&self) -> Result<(), StoreError>;

    /// Insert or update one record by natural key.
    async fn upsert(
        &self,
        record: TimeSeriesRecord,
        now: NaiveDateTime,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Upsert many records; each key is independent, in input order.
    async fn upsert_batch(
        &self,
        records: Vec<TimeSeriesRecord>,
        now: NaiveDateTime,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.upsert(record, now).await?);
        }
        Ok(outcomes)
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<TimeSeriesRecord>, StoreError>;

    async fn count(&self, filter: &RecordFilter) -> Result<usize, StoreError>;

    /// Add a batch to a staged replacement of `entity_id`'s rows.
    async fn stage(
        &self,
        entity_id: &str,
        stage: &StageId,
        batch: Vec<TimeSeriesRecord>,
    ) -> Result<(), StoreError>;

    /// Atomically replace `entity_id`'s rows with the staged ones.
    /// Returns the number of rows now stored for the entity.
    async fn commit_stage(&self, entity_id: &str, stage: &StageId) -> Result<usize, StoreError>;

    /// Drop a staged replacement without touching live rows.
    async fn discard_stage(&self, entity_id: &str, stage: &StageId) -> Result<(), StoreError>;
}
