//! Normalizer: raw vendor rows → typed, deduplicated, ordered records.
//!
//! Shared by direct ingestion and by reconciliation, so both paths compare and
//! store exactly the same shape:
//! - numeric columns coerce to `f64`; blank or unparseable text becomes null
//! - rows with an unparseable timestamp or a null required column are dropped
//! - duplicate timestamps keep the LAST occurrence
//! - output is sorted by timestamp ascending

use super::provider::RawRow;
use crate::domain::{datasets, granularity, TimeSeriesRecord};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::BTreeMap;

/// Column layout of one vendor dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeSpec {
    pub metric_key: String,
    pub granularity: String,
    /// Candidate timestamp columns, first present wins.
    pub timestamp_columns: Vec<String>,
    /// Vendor-side entity column. Dropped: the entity is the requested code.
    pub entity_column: Option<String>,
    /// Numeric columns that must be non-null for a row to survive.
    pub required: Vec<String>,
    pub numeric: Vec<String>,
    /// `(vendor name, stored name)`.
    pub renames: Vec<(String, String)>,
    /// `(stored name, copied from)`, applied after renames.
    pub derived: Vec<(String, String)>,
    /// Constant payload entries stamped on every record.
    pub payload_extras: BTreeMap<String, serde_json::Value>,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl NormalizeSpec {
    /// Daily OHLCV bars. `close_adj` mirrors `close`.
    pub fn daily_bars() -> Self {
        Self {
            metric_key: datasets::DAILY_BARS.to_string(),
            granularity: granularity::DAILY.to_string(),
            timestamp_columns: owned(&["date", "trade_date"]),
            entity_column: Some("code".to_string()),
            required: owned(&["close"]),
            numeric: owned(&[
                "open", "high", "low", "close", "preclose", "volume", "amount", "turn", "pctChg",
            ]),
            renames: vec![("pctChg".to_string(), "pct_chg".to_string())],
            derived: vec![("close_adj".to_string(), "close".to_string())],
            payload_extras: BTreeMap::new(),
        }
    }

    /// Minute bars with the vendor's valuation columns.
    pub fn minute_bars() -> Self {
        Self {
            metric_key: datasets::MINUTE_BARS.to_string(),
            granularity: granularity::MINUTE.to_string(),
            timestamp_columns: owned(&["time", "timestamp"]),
            entity_column: Some("code".to_string()),
            required: owned(&["open", "close"]),
            numeric: owned(&[
                "open", "high", "low", "close", "volume", "amount", "turn", "pctChg", "peTTM",
                "pbMRQ", "psTTM", "pcfNcfTTM",
            ]),
            renames: vec![("pctChg".to_string(), "pct_chg".to_string())],
            derived: Vec::new(),
            payload_extras: BTreeMap::new(),
        }
    }

    /// Quarterly profitability figures, stamped with the fiscal period.
    pub fn fundamentals(year: i32, quarter: u32) -> Self {
        let mut payload_extras = BTreeMap::new();
        payload_extras.insert("year".to_string(), serde_json::Value::from(year));
        payload_extras.insert("quarter".to_string(), serde_json::Value::from(quarter));
        Self {
            metric_key: datasets::FUNDAMENTALS.to_string(),
            granularity: granularity::QUARTERLY.to_string(),
            timestamp_columns: owned(&["report_date", "statDate"]),
            entity_column: Some("code".to_string()),
            required: Vec::new(),
            numeric: owned(&[
                "roe",
                "npMargin",
                "gpMargin",
                "netProfit",
                "epsTTM",
                "mbRevenue",
                "totalShare",
            ]),
            renames: Vec::new(),
            derived: Vec::new(),
            payload_extras,
        }
    }

    fn stored_name<'a>(&'a self, column: &'a str) -> &'a str {
        self.renames
            .iter()
            .find(|(from, _)| from == column)
            .map(|(_, to)| to.as_str())
            .unwrap_or(column)
    }
}

/// Applies one `NormalizeSpec` to raw rows.
#[derive(Debug, Clone)]
pub struct Normalizer {
    spec: NormalizeSpec,
}

impl Normalizer {
    pub fn new(spec: NormalizeSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &NormalizeSpec {
        &self.spec
    }

    pub fn normalize(&self, entity_id: &str, provider: &str, rows: &[RawRow]) -> Vec<TimeSeriesRecord> {
        let mut by_timestamp: BTreeMap<NaiveDateTime, TimeSeriesRecord> = BTreeMap::new();
        for row in rows {
            if let Some(record) = self.normalize_row(entity_id, provider, row) {
                // Later rows overwrite earlier ones: keep-last dedup.
                by_timestamp.insert(record.timestamp, record);
            }
        }
        by_timestamp.into_values().collect()
    }

    fn normalize_row(&self, entity_id: &str, provider: &str, row: &RawRow) -> Option<TimeSeriesRecord> {
        let spec = &self.spec;
        let ts_column = spec
            .timestamp_columns
            .iter()
            .find(|c| row.get(c).is_some_and(|v| !v.trim().is_empty()))?;
        let timestamp = parse_timestamp(row.get(ts_column)?)?;

        let mut record = TimeSeriesRecord::new(entity_id, &spec.metric_key, &spec.granularity, timestamp)
            .with_provider(provider);

        for (column, raw) in row.iter() {
            if spec.timestamp_columns.iter().any(|c| c == column)
                || spec.entity_column.as_deref() == Some(column)
            {
                continue;
            }
            if spec.numeric.iter().any(|c| c == column) {
                record
                    .fields
                    .insert(spec.stored_name(column).to_string(), parse_number(raw));
            } else if !raw.trim().is_empty() {
                record.payload.insert(
                    spec.stored_name(column).to_string(),
                    serde_json::Value::String(raw.trim().to_string()),
                );
            }
        }

        for column in &spec.required {
            if record.field(spec.stored_name(column)).is_none() {
                return None;
            }
        }

        for (target, source) in &spec.derived {
            let value = record.fields.get(source).copied().flatten();
            if record.fields.contains_key(source) {
                record.fields.insert(target.clone(), value);
            }
        }

        for (key, value) in &spec.payload_extras {
            record.payload.insert(key.clone(), value.clone());
        }

        Some(record)
    }
}

/// Parse a numeric cell. Blank, unparseable and non-finite text is null.
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse a vendor timestamp into UTC-naive time.
///
/// Accepts ISO dates and datetimes, RFC 3339 with an offset (converted to
/// UTC), and compact digit stamps: `YYYYMMDD`, `YYYYMMDDhhmmss` and
/// `YYYYMMDDhhmmssSSS`.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return parse_compact(s);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d.and_time(NaiveTime::MIN));
        }
    }
    None
}

fn parse_compact(s: &str) -> Option<NaiveDateTime> {
    let part = |from: usize, to: usize| s.get(from..to)?.parse::<u32>().ok();
    let year = s.get(0..4)?.parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, part(4, 6)?, part(6, 8)?)?;
    match s.len() {
        8 => Some(date.and_time(NaiveTime::MIN)),
        14 => date.and_hms_opt(part(8, 10)?, part(10, 12)?, part(12, 14)?),
        17 => date.and_hms_milli_opt(part(8, 10)?, part(10, 12)?, part(12, 14)?, part(14, 17)?),
        _ => None,
    }
}

/// Fiscal quarters touched by `[start, end]`, in order.
pub fn iter_quarters(start: NaiveDate, end: NaiveDate) -> Vec<(i32, u32)> {
    let quarter_of = |d: NaiveDate| (d.year(), (d.month() - 1) / 3 + 1);
    let (mut year, mut quarter) = quarter_of(start);
    let last = quarter_of(end);
    let mut quarters = Vec::new();
    while (year, quarter) <= last {
        quarters.push((year, quarter));
        if quarter == 4 {
            year += 1;
            quarter = 1;
        } else {
            quarter += 1;
        }
    }
    quarters
}
