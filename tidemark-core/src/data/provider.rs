//! Source adapter trait and structured error types.
//!
//! The SourceAdapter trait abstracts over market-data vendors so the
//! reconciliation controller and the ingestion paths can run against a live
//! vendor, a CSV replay or a scripted fake without change. Adapters yield raw
//! text rows; typing and cleaning belong to the normalizer.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// One vendor row, column name to raw text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow(BTreeMap<String, String>);

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(column, value);
        self
    }

    /// Raw text of a column; `None` when absent.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Structured errors for vendor fetches.
///
/// Every variant surfaces to callers as "source unavailable"; the variant
/// only narrows down what went wrong for logs.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("vendor login failed: {0}")]
    LoginFailed(String),

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found: {code}")]
    SymbolNotFound { code: String },

    #[error("{provider} does not serve {dataset}")]
    Unsupported { provider: String, dataset: String },

    #[error("source error: {0}")]
    Other(String),
}

/// Trait for market-data vendors.
///
/// Implementations handle the specifics of one vendor. They do not know about
/// storage or normalization.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Provider label stamped on every record this adapter produced.
    fn name(&self) -> &str;

    /// Daily bars for `code` over `[start, end]`.
    async fn fetch(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRow>, SourceError>;

    /// Minute bars for `code` over `[start, end]`.
    async fn fetch_intraday(
        &self,
        _code: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<RawRow>, SourceError> {
        Err(SourceError::Unsupported {
            provider: self.name().to_string(),
            dataset: "minute bars".to_string(),
        })
    }

    /// Fundamentals reported for one fiscal quarter.
    async fn fetch_fundamentals(
        &self,
        _code: &str,
        _year: i32,
        _quarter: u32,
    ) -> Result<Vec<RawRow>, SourceError> {
        Err(SourceError::Unsupported {
            provider: self.name().to_string(),
            dataset: "fundamentals".to_string(),
        })
    }
}
