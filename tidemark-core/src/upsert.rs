//! Idempotent natural-key upsert engine.
//!
//! One write primitive shared by every dataset. Validation is all-or-nothing
//! at the batch boundary; once a batch passes, each key is written
//! independently (no cross-record atomicity, last write wins per key).

use crate::domain::{Clock, TimeSeriesRecord, WriteSummary, RESERVED_COLUMNS};
use crate::error::{CoreError, CoreResult};
use crate::store::TimeSeriesStore;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct UpsertEngine {
    clock: Arc<dyn Clock>,
}

impl UpsertEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Validate the whole batch, then upsert every record by natural key.
    pub async fn upsert_many(
        &self,
        store: &dyn TimeSeriesStore,
        records: Vec<TimeSeriesRecord>,
    ) -> CoreResult<WriteSummary> {
        validate_batch(&records)?;
        if records.is_empty() {
            return Ok(WriteSummary::default());
        }
        let now = self.clock.now();
        let outcomes = store.upsert_batch(records, now).await?;
        let summary = WriteSummary::from_outcomes(&outcomes);
        debug!(
            total = summary.total,
            matched = summary.matched,
            modified = summary.modified,
            upserted = summary.upserted,
            "upsert batch written"
        );
        Ok(summary)
    }
}

/// Reject the batch if any record is malformed. Nothing is written on error.
pub fn validate_batch(records: &[TimeSeriesRecord]) -> CoreResult<()> {
    for (i, record) in records.iter().enumerate() {
        validate_record(record).map_err(|detail| {
            CoreError::Validation(format!(
                "record {i} ({}/{}/{} @ {}): {detail}",
                record.entity_id, record.metric_key, record.granularity, record.timestamp
            ))
        })?;
    }
    Ok(())
}

fn validate_record(record: &TimeSeriesRecord) -> Result<(), String> {
    if record.entity_id.trim().is_empty() {
        return Err("entity_id is required".into());
    }
    if record.metric_key.trim().is_empty() {
        return Err("metric_key is required".into());
    }
    if record.granularity.trim().is_empty() {
        return Err("granularity is required".into());
    }
    if record.fields.is_empty() && record.payload.is_empty() {
        return Err("record carries no fields and no payload".into());
    }
    for (name, value) in &record.fields {
        if name.trim().is_empty() {
            return Err("field names must not be blank".into());
        }
        if let Some(v) = value {
            if !v.is_finite() {
                return Err(format!("field '{name}' is not finite"));
            }
        }
    }
    if let (Some(high), Some(low)) = (record.field("high"), record.field("low")) {
        if high < low {
            return Err(format!("high ({high}) is below low ({low})"));
        }
    }
    if let Some(key) = record
        .payload
        .keys()
        .find(|k| RESERVED_COLUMNS.contains(&k.as_str()))
    {
        return Err(format!("payload key '{key}' shadows a record column"));
    }
    Ok(())
}

/// Stamp a caller-supplied batch for `dataset`.
///
/// Sets `metric_key` to the dataset name when the record left it blank, sets
/// `provider`, and lower-cases granularity and tags. Entity ids are trimmed
/// and upper-cased only when they carry no exchange prefix (`sh.600000`
/// stays as is).
pub fn prepare_ingest(
    dataset: &str,
    provider: &str,
    records: Vec<TimeSeriesRecord>,
) -> Vec<TimeSeriesRecord> {
    let provider = provider.trim().to_lowercase();
    records
        .into_iter()
        .map(|mut record| {
            let entity = record.entity_id.trim();
            record.entity_id = if entity.contains('.') {
                entity.to_string()
            } else {
                entity.to_uppercase()
            };
            if record.metric_key.trim().is_empty() {
                record.metric_key = dataset.to_string();
            } else {
                record.metric_key = record.metric_key.trim().to_lowercase();
            }
            record.granularity = record.granularity.trim().to_lowercase();
            if !provider.is_empty() {
                record.provider = provider.clone();
            }
            record.tags = record
                .tags
                .into_iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FixedClock;
    use crate::store::{MemoryStore, RecordFilter};
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn bar(day: u32, close: f64) -> TimeSeriesRecord {
        TimeSeriesRecord::new("X", "daily_bars", "1d", ts(day))
            .with_field("high", close + 1.0)
            .with_field("low", close - 1.0)
            .with_field("close", close)
    }

    fn engine() -> UpsertEngine {
        UpsertEngine::new(Arc::new(FixedClock::new(ts(28))))
    }

    #[tokio::test]
    async fn second_identical_batch_upserts_nothing() {
        let store = MemoryStore::new();
        let batch = vec![bar(2, 10.0), bar(3, 11.0)];
        let first = engine().upsert_many(&store, batch.clone()).await.unwrap();
        assert_eq!(first.upserted, 2);
        let second = engine().upsert_many(&store, batch).await.unwrap();
        assert_eq!(
            second,
            WriteSummary {
                total: 2,
                matched: 2,
                modified: 0,
                upserted: 0
            }
        );
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn changed_value_counts_as_modified() {
        let store = MemoryStore::new();
        engine().upsert_many(&store, vec![bar(2, 10.0)]).await.unwrap();
        let s = engine()
            .upsert_many(&store, vec![bar(2, 10.5), bar(3, 9.0)])
            .await
            .unwrap();
        assert_eq!(s.matched, 1);
        assert_eq!(s.modified, 1);
        assert_eq!(s.upserted, 1);
    }

    #[tokio::test]
    async fn malformed_record_aborts_whole_batch() {
        let store = MemoryStore::new();
        let mut bad = bar(3, 10.0);
        bad.entity_id = " ".into();
        let err = engine()
            .upsert_many(&store, vec![bar(2, 10.0), bad])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let bad = bar(2, 10.0).with_field("high", 5.0);
        assert!(validate_batch(&[bad]).is_err());
    }

    #[test]
    fn reserved_payload_key_is_rejected() {
        let bad = bar(2, 10.0).with_payload("timestamp", serde_json::json!("x"));
        let err = validate_batch(&[bad]).unwrap_err();
        assert!(err.to_string().contains("shadows"));
    }

    #[test]
    fn empty_record_is_rejected() {
        let bad = TimeSeriesRecord::new("X", "daily_bars", "1d", ts(2));
        assert!(validate_batch(&[bad]).is_err());
    }

    #[test]
    fn prepare_ingest_normalizes_tokens() {
        let raw = TimeSeriesRecord::new(" aapl ", "", "1D", ts(2))
            .with_field("close", 1.0)
            .with_tag(" Tech ")
            .with_tag("");
        let out = prepare_ingest("qlib_bars", " Qlib ", vec![raw]);
        assert_eq!(out[0].entity_id, "AAPL");
        assert_eq!(out[0].metric_key, "qlib_bars");
        assert_eq!(out[0].granularity, "1d");
        assert_eq!(out[0].provider, "qlib");
        assert_eq!(out[0].tags.iter().collect::<Vec<_>>(), vec!["tech"]);

        let prefixed = TimeSeriesRecord::new("sh.600000", "daily_bars", "1d", ts(2));
        assert_eq!(prepare_ingest("daily_bars", "", vec![prefixed])[0].entity_id, "sh.600000");
    }

    #[tokio::test]
    async fn upsert_stamps_bookkeeping_times() {
        let store = MemoryStore::new();
        engine().upsert_many(&store, vec![bar(2, 10.0)]).await.unwrap();
        let stored = store.get(&bar(2, 10.0).natural_key()).unwrap();
        assert_eq!(stored.created_at, Some(ts(28)));
        assert_eq!(stored.updated_at, Some(ts(28)));
        assert_eq!(stored.ingested_at, Some(ts(28)));
        assert_eq!(store.count(&RecordFilter::entity("X")).await.unwrap(), 1);
    }
}
