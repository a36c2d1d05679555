//! Relative Strength Index (RSI).
//!
//! Average gain and average loss over the trailing `window` close-to-close
//! changes (default 14); during warm-up the average covers the changes seen
//! so far.
//! RSI = 100 - 100 / (1 + avg_gain / avg_loss)
//! Edge cases: first bar → 50; avg_loss == 0 → 100 (flat windows included);
//! avg_gain == 0 → 0.

use super::{closes, points, Calculator, PriceBar, SeriesPoint};
use crate::domain::{IndicatorDefinition, IndicatorParams};
use crate::error::CoreResult;

pub const DEFAULT_WINDOW: usize = 14;
pub const NEUTRAL: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct Rsi {
    definition: IndicatorDefinition,
}

impl Rsi {
    pub fn new() -> Self {
        Self {
            definition: IndicatorDefinition::new("RSI", "Relative Strength Index")
                .describe("Average gain versus average loss over the trailing window")
                .default_params(IndicatorParams::new().with("window", DEFAULT_WINDOW))
                .source_label("builtin"),
        }
    }
}

impl Default for Rsi {
    fn default() -> Self {
        Self::new()
    }
}

impl Calculator for Rsi {
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
        Ok(points(bars, &rsi_of_series(&closes(bars), window)))
    }
}

pub fn rsi_of_series(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    // gains[i] / losses[i] hold the change from i-1 to i; index 0 is unused.
    let mut gains = vec![0.0; n];
    let mut losses = vec![0.0; n];
    for i in 1..n {
        let change = values[i] - values[i - 1];
        gains[i] = change.max(0.0);
        losses[i] = (-change).max(0.0);
    }

    let mut result = Vec::with_capacity(n);
    result.push(NEUTRAL);
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for i in 1..n {
        gain_sum += gains[i];
        loss_sum += losses[i];
        if i > window {
            gain_sum -= gains[i - window];
            loss_sum -= losses[i - window];
        }
        let count = i.min(window) as f64;
        result.push(compute_rsi(gain_sum / count, loss_sum / count));
    }
    result
}

/// Compute RSI from average gain and average loss.
fn compute_rsi(avg_gain: f64, avg_loss: f64) -> f64 {
    // Rolling sums can leave tiny residues instead of exact zeros.
    let avg_gain = if avg_gain.abs() < 1e-12 { 0.0 } else { avg_gain };
    let avg_loss = if avg_loss.abs() < 1e-12 { 0.0 } else { avg_loss };
    if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}
