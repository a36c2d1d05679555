//! Average True Range (ATR).
//!
//! True Range = max(high - low, |high - prev_close|, |low - prev_close|)
//! First bar TR = high - low (no previous close).
//! ATR = rolling mean of TR over `window` (default 14), prefix-averaged during warm-up.

use super::sma::rolling_mean;
use super::{points, Calculator, PriceBar, SeriesPoint};
use crate::domain::{IndicatorDefinition, IndicatorParams};
use crate::error::CoreResult;

pub const DEFAULT_WINDOW: usize = 14;

#[derive(Debug, Clone)]
pub struct Atr {
    definition: IndicatorDefinition,
}

impl Atr {
    pub fn new() -> Self {
        Self {
            definition: IndicatorDefinition::new("ATR", "Average True Range")
                .describe("Rolling mean of the true range")
                .default_params(IndicatorParams::new().with("window", DEFAULT_WINDOW))
                .source_label("builtin"),
        }
    }
}

impl Default for Atr {
    fn default() -> Self {
        Self::new()
    }
}

impl Calculator for Atr {
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
        Ok(points(bars, &rolling_mean(&true_range(bars), window)))
    }
}

/// Compute True Range for each bar.
pub fn true_range(bars: &[PriceBar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let hl = bar.high - bar.low;
            if i == 0 {
                return hl;
            }
            let prev_close = bars[i - 1].close;
            hl.max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{assert_approx, make_bars, values, DEFAULT_EPSILON};

    #[test]
    fn true_range_basic() {
        // make_bars: high = max(open,close)+1, low = min(open,close)-1
        // Bar 0: close=10, open=10, H=11, L=9 → TR = 2
        // Bar 1: close=12, open=10, H=13, L=9 → TR = max(4, |13-10|, |9-10|) = 4
        let bars = make_bars(&[10.0, 12.0]);
        let tr = true_range(&bars);
        assert_approx(tr[0], 2.0, DEFAULT_EPSILON);
        assert_approx(tr[1], 4.0, DEFAULT_EPSILON);
    }

    #[test]
    fn gap_uses_previous_close() {
        let mut bars = make_bars(&[10.0, 10.0]);
        // Gap up: high 21, low 20 against prev close 10 → TR = 11
        bars[1].high = 21.0;
        bars[1].low = 20.0;
        assert_approx(true_range(&bars)[1], 11.0, DEFAULT_EPSILON);
    }

    #[test]
    fn atr_constant_range() {
        // All bars same price → TR = 2 (H-L from make_bars)
        let bars = make_bars(&[100.0; 20]);
        let params = IndicatorParams::new().with("window", 5);
        let result = values(&Atr::new().compute("TEST", &bars, &params).unwrap());
        assert_eq!(result.len(), 20);
        for v in result {
            assert_approx(v, 2.0, DEFAULT_EPSILON);
        }
    }

    #[test]
    fn atr_warm_up_averages_prefix() {
        let bars = make_bars(&[10.0, 12.0]);
        let result = values(&Atr::new().compute("TEST", &bars, &IndicatorParams::new()).unwrap());
        assert_approx(result[1], 3.0, DEFAULT_EPSILON);
    }
}
