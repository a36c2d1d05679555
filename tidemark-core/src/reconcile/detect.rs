//! Windowed anomaly detection.
//!
//! For every date of the recent window, compares the key fields in order
//! `close_adj, open, high, low` and stops at the first violated field. A date
//! absent from storage is a missing date and is not compared.

use crate::domain::{Anomaly, TimeSeriesRecord};
use chrono::NaiveDate;
use std::collections::BTreeMap;

pub const KEY_FIELDS: [&str; 4] = ["close_adj", "open", "high", "low"];

/// Stored magnitudes at or below this compare by absolute difference.
pub const ZERO_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub anomalies: Vec<Anomaly>,
    pub missing_dates: Vec<NaiveDate>,
}

impl Detection {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty() && self.missing_dates.is_empty()
    }
}

/// Compare one field. `Some` when it violates `threshold`.
///
/// Both null → agree. One null → anomaly without an error figure. Stored
/// value ~0 → absolute difference against `threshold`. Otherwise relative
/// error, strictly greater than `threshold`.
pub fn check_field(
    date: NaiveDate,
    field: &str,
    old: Option<f64>,
    new: Option<f64>,
    threshold: f64,
) -> Option<Anomaly> {
    let anomaly = |error: Option<f64>| Anomaly {
        date,
        field: field.to_string(),
        old,
        new,
        error,
    };
    match (old, new) {
        (None, None) => None,
        (None, Some(_)) | (Some(_), None) => Some(anomaly(None)),
        (Some(o), Some(n)) => {
            if o.abs() <= ZERO_TOLERANCE {
                ((n - o).abs() > threshold).then(|| anomaly(None))
            } else {
                let error = (n - o).abs() / o.abs();
                (error > threshold).then(|| anomaly(Some(error)))
            }
        }
    }
}

/// Check the recent window against stored rows keyed by date.
pub fn detect_anomalies(
    recent: &[TimeSeriesRecord],
    stored: &BTreeMap<NaiveDate, TimeSeriesRecord>,
    threshold: f64,
) -> Detection {
    let mut detection = Detection::default();
    for fetched in recent {
        let date = fetched.date();
        let Some(existing) = stored.get(&date) else {
            detection.missing_dates.push(date);
            continue;
        };
        let violation = KEY_FIELDS.iter().find_map(|field| {
            check_field(
                date,
                field,
                existing.field(field),
                fetched.field(field),
                threshold,
            )
        });
        if let Some(anomaly) = violation {
            detection.anomalies.push(anomaly);
        }
    }
    detection
}
