//! Indicator calculators, the calculator registry and the indicator pipeline.
//!
//! Calculators are pure: they receive the bars and the merged params and
//! return a derived series. Reading bars and persisting points belongs to
//! `IndicatorPipeline`, which writes through the upsert engine.
//!
//! Builtins (MA, RSI, MACD, BOLL, ATR) are registered by `CalculatorRegistry::with_builtins`.
//! Custom calculators are resolved from a compile-time catalog when they are
//! defined, never per call.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod momentum;
pub mod pipeline;
pub mod registry;
pub mod rsi;
pub mod sma;

pub use atr::Atr;
pub use bollinger::Boll;
pub use ema::ema_of_series;
pub use macd::Macd;
pub use momentum::MomentumV1;
pub use pipeline::{
    ComputeBatch, ComputeOutcome, IndicatorPage, IndicatorPipeline, IndicatorSeries, IndicatorValue,
    SeriesQuery,
};
pub use registry::{CalculatorRegistry, CUSTOM_CATALOG};
pub use rsi::Rsi;
pub use sma::{rolling_mean, Ma};

use crate::domain::{IndicatorDefinition, IndicatorParams, TimeSeriesRecord};
use crate::error::CoreResult;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// OHLCV view of one stored daily bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBar {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

impl PriceBar {
    /// `None` when the record has no close. Missing open/high/low fall back to close.
    pub fn from_record(record: &TimeSeriesRecord) -> Option<Self> {
        let close = record.field("close")?;
        Some(Self {
            timestamp: record.timestamp,
            open: record.field("open").unwrap_or(close),
            high: record.field("high").unwrap_or(close),
            low: record.field("low").unwrap_or(close),
            close,
            volume: record.field("volume"),
        })
    }
}

/// One computed point. Calculators may leave `timestamp` or `value` empty;
/// the pipeline drops points it cannot key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, f64>,
}

impl SeriesPoint {
    /// Point at a UTC-naive bar timestamp.
    pub fn at(timestamp: NaiveDateTime, value: f64) -> Self {
        Self {
            timestamp: Some(Utc.from_utc_datetime(&timestamp).into()),
            value: Some(value),
            extras: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extras.insert(name.into(), value);
        self
    }

    /// Timestamp converted to UTC and stripped of its offset.
    pub fn utc_naive(&self) -> Option<NaiveDateTime> {
        self.timestamp.map(|ts| ts.naive_utc())
    }
}

/// A derived-series calculator.
///
/// Implementations are registered once and shared across tasks, so they must
/// be stateless between calls.
pub trait Calculator: Send + Sync {
    fn definition(&self) -> &IndicatorDefinition;

    /// Compute the series for `target` over `bars` (ascending by timestamp).
    /// `params` are already merged over the definition's defaults.
    fn compute(
        &self,
        target: &str,
        bars: &[PriceBar],
        params: &IndicatorParams,
    ) -> CoreResult<Vec<SeriesPoint>>;
}

pub(crate) fn closes(bars: &[PriceBar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Zip bar timestamps with computed values.
pub(crate) fn points(bars: &[PriceBar], values: &[f64]) -> Vec<SeriesPoint> {
    bars.iter()
        .zip(values)
        .map(|(bar, value)| SeriesPoint::at(bar.timestamp, *value))
        .collect()
}

/// Create synthetic bars from close prices for testing.
///
/// Generates plausible OHLV: open = prev_close (or close for first bar),
/// high = max(open,close) + 1.0, low = min(open,close) - 1.0, volume = 1000.
#[cfg(test)]
pub fn make_bars(closes: &[f64]) -> Vec<PriceBar> {
    let base = chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            PriceBar {
                timestamp: base + chrono::Duration::days(i as i64),
                open,
                high: open.max(close) + 1.0,
                low: open.min(close) - 1.0,
                close,
                volume: Some(1000.0),
            }
        })
        .collect()
}

/// Series values, panicking on a missing value.
#[cfg(test)]
pub fn values(points: &[SeriesPoint]) -> Vec<f64> {
    points.iter().map(|p| p.value.unwrap()).collect()
}

/// Assert two f64 values are approximately equal (within epsilon).
#[cfg(test)]
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "assert_approx failed: actual={actual}, expected={expected}, diff={}, epsilon={epsilon}",
        (actual - expected).abs()
    );
}

/// Default epsilon for indicator tests.
#[cfg(test)]
pub const DEFAULT_EPSILON: f64 = 1e-10;
