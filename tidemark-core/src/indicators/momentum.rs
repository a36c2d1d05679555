//! Momentum, custom calculator `momentum_v1`.
//!
//! momentum[t] = (close[t] - close[t-period]) / close[t-period]
//! 0 while t < period (default 20) and when the base close is 0.

use super::{closes, points, Calculator, PriceBar, SeriesPoint};
use crate::domain::{IndicatorDefinition, IndicatorParams};
use crate::error::CoreResult;

pub const IMPL_REF: &str = "momentum_v1";
pub const DEFAULT_PERIOD: usize = 20;

#[derive(Debug, Clone)]
pub struct MomentumV1 {
    definition: IndicatorDefinition,
}

impl MomentumV1 {
    /// Bind the implementation to a user-supplied definition.
    pub fn new(definition: IndicatorDefinition) -> Self {
        Self { definition }
    }

    /// Definition used when the calculator is registered without configuration.
    pub fn default_definition() -> IndicatorDefinition {
        IndicatorDefinition::new("MOMENTUM_V1", "Momentum v1")
            .describe("Fractional change of close over `period` bars")
            .default_params(IndicatorParams::new().with("period", DEFAULT_PERIOD))
            .source_label("custom")
    }
}

impl Calculator for MomentumV1 {
    fn definition(&self) -> &IndicatorDefinition {
        &self.definition
    }

    fn compute(
        &self,
        _target: &str,
        bars: &[PriceBar],
        params: &IndicatorParams,
    ) -> CoreResult<Vec<SeriesPoint>> {
        let period = params.window("period", DEFAULT_PERIOD);
        Ok(points(bars, &momentum_of_series(&closes(bars), period)))
    }
}

pub fn momentum_of_series(values: &[f64], period: usize) -> Vec<f64> {
    values
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            if i < period {
                return 0.0;
            }
            let base = values[i - period];
            if base == 0.0 {
                0.0
            } else {
                (close - base) / base
            }
        })
        .collect()
}
