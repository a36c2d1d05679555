//! Moving Average (MA).
//!
//! Rolling mean of close prices over `window` (default 5).
//! Warm-up uses the available prefix, so the first value is the first close.

use super::{closes, points, Calculator, PriceBar, SeriesPoint};
use crate::domain::{IndicatorDefinition, IndicatorParams};
use crate::error::CoreResult;

pub const DEFAULT_WINDOW: usize = 5;

#[derive(Debug, Clone)]
pub struct Ma {
    definition: IndicatorDefinition,
}

impl Ma {
    pub fn new() -> Self {
        Self {
            definition: IndicatorDefinition::new("MA", "Moving Average")
                .describe("Rolling mean of close prices")
                .default_params(IndicatorParams::new().with("window", DEFAULT_WINDOW))
                .source_label("builtin"),
        }
    }
}

impl Default for Ma {
    fn default() -> Self {
        Self::new()
    }
}

impl Calculator for Ma {
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
        Ok(points(bars, &rolling_mean(&closes(bars), window)))
    }
}

/// Trailing mean over at most `window` values (minimum one value).
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let mut result = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for i in 0..values.len() {
        sum += values[i];
        if i >= window {
            sum -= values[i - window];
        }
        let count = (i + 1).min(window);
        result.push(sum / count as f64);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{assert_approx, make_bars, values, DEFAULT_EPSILON};

    #[test]
    fn ma_3_basic() {
        let bars = make_bars(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        let params = IndicatorParams::new().with("window", 3);
        let result = values(&Ma::new().compute("TEST", &bars, &params).unwrap());

        assert_eq!(result.len(), 5);
        // Warm-up: mean of what is available
        assert_approx(result[0], 10.0, DEFAULT_EPSILON);
        assert_approx(result[1], 10.5, DEFAULT_EPSILON);
        // MA[2] = mean(10,11,12) = 11.0
        assert_approx(result[2], 11.0, DEFAULT_EPSILON);
        assert_approx(result[3], 12.0, DEFAULT_EPSILON);
        assert_approx(result[4], 13.0, DEFAULT_EPSILON);
    }

    #[test]
    fn ma_1_is_close() {
        let bars = make_bars(&[100.0, 200.0, 300.0]);
        let params = IndicatorParams::new().with("window", 1);
        let result = values(&Ma::new().compute("TEST", &bars, &params).unwrap());
        assert_eq!(result, vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn zero_window_is_clamped() {
        let bars = make_bars(&[1.0, 3.0]);
        let params = IndicatorParams::new().with("window", 0);
        let result = values(&Ma::new().compute("TEST", &bars, &params).unwrap());
        assert_eq!(result, vec![1.0, 3.0]);
    }

    #[test]
    fn timestamps_follow_bars() {
        let bars = make_bars(&[1.0, 2.0]);
        let result = Ma::new()
            .compute("TEST", &bars, &IndicatorParams::new())
            .unwrap();
        assert_eq!(result[1].utc_naive(), Some(bars[1].timestamp));
    }

    #[test]
    fn empty_bars_empty_series() {
        let result = Ma::new().compute("TEST", &[], &IndicatorParams::new()).unwrap();
        assert!(result.is_empty());
    }
}
