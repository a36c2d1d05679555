//! TimeSeriesRecord: one bar, fundamental or indicator point.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Column names owned by the record itself. Payload entries may not shadow them.
pub const RESERVED_COLUMNS: &[&str] = &[
    "entity_id",
    "metric_key",
    "granularity",
    "timestamp",
    "fields",
    "tags",
    "provider",
    "payload",
    "created_at",
    "updated_at",
    "ingested_at",
];

/// The tuple that identifies a record within a dataset.
///
/// Field order matters: records sort by entity first, so every row of one
/// instrument is contiguous in an ordered map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub entity_id: String,
    pub metric_key: String,
    pub granularity: String,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRecord {
    pub entity_id: String,
    pub metric_key: String,
    pub granularity: String,
    /// UTC, no timezone.
    pub timestamp: NaiveDateTime,
    /// Numeric columns. `None` keeps a column the vendor sent but left blank.
    #[serde(default)]
    pub fields: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub ingested_at: Option<NaiveDateTime>,
}

impl TimeSeriesRecord {
    pub fn new(
        entity_id: impl Into<String>,
        metric_key: impl Into<String>,
        granularity: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            metric_key: metric_key.into(),
            granularity: granularity.into(),
            timestamp,
            fields: BTreeMap::new(),
            tags: BTreeSet::new(),
            provider: String::new(),
            payload: BTreeMap::new(),
            created_at: None,
            updated_at: None,
            ingested_at: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), Some(value));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            entity_id: self.entity_id.clone(),
            metric_key: self.metric_key.clone(),
            granularity: self.granularity.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Value of a numeric column; `None` when absent or blank.
    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied().flatten()
    }

    /// Calendar date of the timestamp.
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    /// True when the stored content matches, ignoring bookkeeping timestamps.
    pub fn same_content(&self, other: &TimeSeriesRecord) -> bool {
        self.fields == other.fields
            && self.tags == other.tags
            && self.provider == other.provider
            && self.payload == other.payload
    }

    /// Apply an incoming write on top of this stored record.
    ///
    /// Numeric fields and payload entries overlay the stored ones; tags and
    /// provider are replaced. Bookkeeping timestamps are left to the caller.
    pub fn overlay(&self, incoming: TimeSeriesRecord) -> TimeSeriesRecord {
        let mut merged = self.clone();
        merged.fields.extend(incoming.fields);
        merged.payload.extend(incoming.payload);
        merged.tags = incoming.tags;
        merged.provider = incoming.provider;
        merged.ingested_at = incoming.ingested_at.or(self.ingested_at);
        merged
    }
}
