//! Bollinger Bands (BOLL).
//!
//! Middle: rolling mean of close over `window` (default 20).
//! Upper/Lower: middle +/- `num_std` (default 2) * population stddev.
//!
//! Only the middle band is the persisted value; the outer bands travel as
//! `upper`/`lower` extras on each point.

use super::{closes, Calculator, PriceBar, SeriesPoint};
use crate::domain::{IndicatorDefinition, IndicatorParams};
use crate::error::CoreResult;

pub const DEFAULT_WINDOW: usize = 20;
pub const DEFAULT_NUM_STD: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct Boll {
    definition: IndicatorDefinition,
    persist_bands: bool,
}

impl Boll {
    pub fn new() -> Self {
        Self {
            definition: IndicatorDefinition::new("BOLL", "Bollinger Bands")
                .describe("Rolling mean of close prices (middle band)")
                .default_params(
                    IndicatorParams::new()
                        .with("window", DEFAULT_WINDOW)
                        .with("num_std", DEFAULT_NUM_STD),
                )
                .source_label("builtin"),
            persist_bands: false,
        }
    }

    /// Also emit the upper and lower bands as extras.
    pub fn with_bands(mut self) -> Self {
        self.persist_bands = true;
        self
    }
}

impl Default for Boll {
    fn default() -> Self {
        Self::new()
    }
}

impl Calculator for Boll {
    fn definition(&self) -> &IndicatorDefinition {
        &self.definition
    }

    fn compute(
        &self,
        _target: &str,
        bars: &[PriceBar],
        params: &IndicatorParams,
    ) -> CoreResult<Vec<SeriesPoint>> {
        let window = params.window("window", DEFAULT_WINDOW);
        let num_std = params.float("num_std", DEFAULT_NUM_STD);
        let closes = closes(bars);

        Ok(bars
            .iter()
            .enumerate()
            .map(|(i, bar)| {
                let start = (i + 1).saturating_sub(window);
                let slice = &closes[start..=i];
                let mean = slice.iter().sum::<f64>() / slice.len() as f64;
                let point = SeriesPoint::at(bar.timestamp, mean);
                if !self.persist_bands {
                    return point;
                }
                // Population stddev
                let variance = slice.iter().map(|c| (c - mean).powi(2)).sum::<f64>()
                    / slice.len() as f64;
                let width = num_std * variance.sqrt();
                point
                    .with_extra("upper", mean + width)
                    .with_extra("lower", mean - width)
            })
            .collect())
    }
}
