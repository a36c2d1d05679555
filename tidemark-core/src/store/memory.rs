//! Embedded in-memory table behind the `TimeSeriesStore` interface.
//!
//! Supports exactly the query subset the core uses: equality and
//! set-membership filters, a timestamp range, single-key sort, skip and limit.

use super::{merge_upsert, RecordFilter, RecordQuery, StageId, StoreError, TimeSeriesStore};
use crate::domain::{NaturalKey, TimeSeriesRecord, UpsertOutcome};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<NaturalKey, TimeSeriesRecord>>,
    stages: Mutex<HashMap<(String, StageId), Vec<TimeSeriesRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn get(&self, key: &NaturalKey) -> Option<TimeSeriesRecord> {
        self.rows.read().get(key).cloned()
    }

    /// Write a record as-is, bypassing upsert accounting.
    pub fn put(&self, record: TimeSeriesRecord) {
        self.rows.write().insert(record.natural_key(), record);
    }

    pub fn remove(&self, key: &NaturalKey) -> Option<TimeSeriesRecord> {
        self.rows.write().remove(key)
    }

    /// Number of open staged refreshes.
    pub fn pending_stages(&self) -> usize {
        self.stages.lock().len()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn bootstrap(&self) -> Result<(), StoreError> {
        self.stages.lock().clear();
        Ok(())
    }

    async fn upsert(
        &self,
        record: TimeSeriesRecord,
        now: NaiveDateTime,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = record.natural_key();
        let mut rows = self.rows.write();
        let (merged, outcome) = merge_upsert(rows.get(&key), record, now);
        rows.insert(key, merged);
        Ok(outcome)
    }

    async fn find(&self, query: &RecordQuery) -> Result<Vec<TimeSeriesRecord>, StoreError> {
        let rows = self.rows.read();
        Ok(query.apply(rows.values().cloned()))
    }

    async fn count(&self, filter: &RecordFilter) -> Result<usize, StoreError> {
        Ok(self.rows.read().values().filter(|r| filter.matches(r)).count())
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
        self.stages
            .lock()
            .entry((entity_id.to_string(), stage.clone()))
            .or_default()
            .extend(batch);
        Ok(())
    }

    async fn commit_stage(&self, entity_id: &str, stage: &StageId) -> Result<usize, StoreError> {
        // Staging an empty batch still opens the stage; an unknown id never commits.
        let staged = self
            .stages
            .lock()
            .remove(&(entity_id.to_string(), stage.clone()))
            .ok_or_else(|| StoreError::StageNotFound {
                entity_id: entity_id.to_string(),
                stage: stage.to_string(),
            })?;

        let mut rows = self.rows.write();
        rows.retain(|key, _| key.entity_id != entity_id);
        let before = rows.len();
        for record in staged {
            rows.insert(record.natural_key(), record);
        }
        Ok(rows.len() - before)
    }

    async fn discard_stage(&self, entity_id: &str, stage: &StageId) -> Result<(), StoreError> {
        self.stages
            .lock()
            .remove(&(entity_id.to_string(), stage.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn rec(entity: &str, day: u32, close: f64) -> TimeSeriesRecord {
        TimeSeriesRecord::new(entity, "daily_bars", "1d", ts(day)).with_field("close", close)
    }

    #[tokio::test]
    async fn upsert_reports_outcomes() {
        let store = MemoryStore::new();
        assert_eq!(
            store.upsert(rec("X", 2, 10.0), ts(20)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(rec("X", 2, 10.0), ts(21)).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            store.upsert(rec("X", 2, 10.5), ts(22)).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(store.len(), 1);
        let stored = store.get(&rec("X", 2, 0.0).natural_key()).unwrap();
        assert_eq!(stored.created_at, Some(ts(20)));
        assert_eq!(stored.updated_at, Some(ts(22)));
    }

    #[tokio::test]
    async fn commit_replaces_only_the_entity() {
        let store = MemoryStore::new();
        store.put(rec("X", 2, 1.0));
        store.put(rec("X", 3, 1.0));
        store.put(rec("Y", 2, 5.0));

        let stage = StageId::generate();
        store.stage("X", &stage, vec![rec("X", 4, 2.0)]).await.unwrap();
        store.stage("X", &stage, vec![rec("X", 5, 2.0)]).await.unwrap();
        // Live rows untouched until commit.
        assert_eq!(store.count(&RecordFilter::entity("X")).await.unwrap(), 2);

        let committed = store.commit_stage("X", &stage).await.unwrap();
        assert_eq!(committed, 2);
        let xs = store
            .find(&RecordQuery::new(RecordFilter::entity("X")))
            .await
            .unwrap();
        assert_eq!(
            xs.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
            vec![ts(4), ts(5)]
        );
        assert_eq!(store.count(&RecordFilter::entity("Y")).await.unwrap(), 1);
        assert_eq!(store.pending_stages(), 0);
    }

    #[tokio::test]
    async fn discard_leaves_live_rows() {
        let store = MemoryStore::new();
        store.put(rec("X", 2, 1.0));
        let stage = StageId::generate();
        store.stage("X", &stage, vec![rec("X", 9, 2.0)]).await.unwrap();
        store.discard_stage("X", &stage).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.pending_stages(), 0);
    }

    #[tokio::test]
    async fn staging_rejects_foreign_rows() {
        let store = MemoryStore::new();
        let err = store
            .stage("X", &StageId::generate(), vec![rec("Y", 1, 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignStagedRecord { .. }));
    }

    #[tokio::test]
    async fn empty_stage_clears_entity() {
        let store = MemoryStore::new();
        store.put(rec("X", 2, 1.0));
        let stage = StageId::generate();
        store.stage("X", &stage, Vec::new()).await.unwrap();
        let committed = store.commit_stage("X", &stage).await.unwrap();
        assert_eq!(committed, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_stage_never_commits() {
        let store = MemoryStore::new();
        store.put(rec("X", 2, 1.0));
        let err = store
            .commit_stage("X", &StageId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StageNotFound { .. }));
        assert_eq!(store.len(), 1);
    }
}
