//! Moving Average Convergence Divergence (MACD).
//!
//! DIF = EMA(close, fast) - EMA(close, slow)
//! DEA = EMA(DIF, signal)
//! MACD = (DIF - DEA) * 2
//! Defaults: fast 12, slow 26, signal 9. Each point carries `dif` and `dea` extras.

use super::ema::ema_of_series;
use super::{closes, Calculator, PriceBar, SeriesPoint};
use crate::domain::{IndicatorDefinition, IndicatorParams};
use crate::error::{CoreError, CoreResult};

pub const DEFAULT_FAST: usize = 12;
pub const DEFAULT_SLOW: usize = 26;
pub const DEFAULT_SIGNAL: usize = 9;

#[derive(Debug, Clone)]
pub struct Macd {
    definition: IndicatorDefinition,
}

impl Macd {
    pub fn new() -> Self {
        Self {
            definition: IndicatorDefinition::new("MACD", "Moving Average Convergence Divergence")
                .describe("Histogram of the DIF line against its signal line")
                .default_params(
                    IndicatorParams::new()
                        .with("fast", DEFAULT_FAST)
                        .with("slow", DEFAULT_SLOW)
                        .with("signal", DEFAULT_SIGNAL),
                )
                .source_label("builtin"),
        }
    }
}

impl Default for Macd {
    fn default() -> Self {
        Self::new()
    }
}

impl Calculator for Macd {
    fn definition(&self) -> &IndicatorDefinition {
        &self.definition
    }

    fn compute(
        &self,
        _target: &str,
        bars: &[PriceBar],
        params: &IndicatorParams,
    ) -> CoreResult<Vec<SeriesPoint>> {
        let fast = params.window("fast", DEFAULT_FAST);
        let slow = params.window("slow", DEFAULT_SLOW);
        let signal = params.window("signal", DEFAULT_SIGNAL);
        if fast >= slow {
            return Err(CoreError::Calculation {
                key: self.definition.key.clone(),
                detail: format!("fast span {fast} must be shorter than slow span {slow}"),
            });
        }

        let closes = closes(bars);
        let ema_fast = ema_of_series(&closes, fast);
        let ema_slow = ema_of_series(&closes, slow);
        let dif: Vec<f64> = ema_fast.iter().zip(&ema_slow).map(|(f, s)| f - s).collect();
        let dea = ema_of_series(&dif, signal);

        Ok(bars
            .iter()
            .zip(dif.iter().zip(&dea))
            .map(|(bar, (&dif, &dea))| {
                SeriesPoint::at(bar.timestamp, (dif - dea) * 2.0)
                    .with_extra("dif", dif)
                    .with_extra("dea", dea)
            })
            .collect())
    }
}
