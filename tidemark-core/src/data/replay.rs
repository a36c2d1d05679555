//! In-memory source adapter.
//!
//! Serves preloaded rows per code, filtered by the requested date range, and
//! can be told to fail for specific codes. Used for offline replays and as the
//! vendor double in tests.

use super::normalize::parse_timestamp;
use super::provider::{RawRow, SourceAdapter, SourceError};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct Tables {
    daily: HashMap<String, Vec<RawRow>>,
    intraday: HashMap<String, Vec<RawRow>>,
    fundamentals: HashMap<(String, i32, u32), Vec<RawRow>>,
    failures: HashMap<String, SourceError>,
}

pub struct StaticSource {
    name: String,
    tables: RwLock<Tables>,
    calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(Tables::default()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Replace the daily rows served for `code`.
    pub fn set_daily(&self, code: &str, rows: Vec<RawRow>) {
        self.tables.write().daily.insert(code.to_string(), rows);
    }

    pub fn set_intraday(&self, code: &str, rows: Vec<RawRow>) {
        self.tables.write().intraday.insert(code.to_string(), rows);
    }

    pub fn set_fundamentals(&self, code: &str, year: i32, quarter: u32, rows: Vec<RawRow>) {
        self.tables
            .write()
            .fundamentals
            .insert((code.to_string(), year, quarter), rows);
    }

    /// Every later fetch for `code` fails with `error`.
    pub fn fail_with(&self, code: &str, error: SourceError) {
        self.tables.write().failures.insert(code.to_string(), error);
    }

    pub fn clear_failure(&self, code: &str) {
        self.tables.write().failures.remove(code);
    }

    /// Number of fetch calls served so far, failures included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, code: &str) -> Result<(), SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.tables.read().failures.get(code) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Rows whose first parseable date column falls inside `[start, end]`.
/// Rows without a parseable date are passed through for the normalizer to drop.
fn in_range(rows: &[RawRow], start: NaiveDate, end: NaiveDate, columns: &[&str]) -> Vec<RawRow> {
    rows.iter()
        .filter(|row| {
            let ts = columns
                .iter()
                .find_map(|c| row.get(c).and_then(parse_timestamp));
            match ts {
                Some(ts) => ts.date() >= start && ts.date() <= end,
                None => true,
            }
        })
        .cloned()
        .collect()
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRow>, SourceError> {
        self.check(code)?;
        let tables = self.tables.read();
        Ok(tables
            .daily
            .get(code)
            .map(|rows| in_range(rows, start, end, &["date", "trade_date"]))
            .unwrap_or_default())
    }

    async fn fetch_intraday(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawRow>, SourceError> {
        self.check(code)?;
        let tables = self.tables.read();
        Ok(tables
            .intraday
            .get(code)
            .map(|rows| in_range(rows, start, end, &["time", "timestamp", "date"]))
            .unwrap_or_default())
    }

    async fn fetch_fundamentals(
        &self,
        code: &str,
        year: i32,
        quarter: u32,
    ) -> Result<Vec<RawRow>, SourceError> {
        self.check(code)?;
        let tables = self.tables.read();
        Ok(tables
            .fundamentals
            .get(&(code.to_string(), year, quarter))
            .cloned()
            .unwrap_or_default())
    }
}

/// Build daily rows from `(date, close)` pairs with a flat OHLC around close.
pub fn daily_rows(code: &str, closes: &[(NaiveDate, f64)]) -> Vec<RawRow> {
    closes
        .iter()
        .map(|(date, close)| {
            [
                ("date", date.format("%Y-%m-%d").to_string()),
                ("code", code.to_string()),
                ("open", close.to_string()),
                ("high", close.to_string()),
                ("low", close.to_string()),
                ("close", close.to_string()),
                ("volume", "1000".to_string()),
            ]
            .into_iter()
            .collect()
        })
        .collect()
}
