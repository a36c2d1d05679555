//! Domain types for Tidemark

pub mod clock;
pub mod indicator;
pub mod record;
pub mod report;
pub mod summary;

pub use clock::{Clock, FixedClock, SystemClock};
pub use indicator::{IndicatorDefinition, IndicatorParams};
pub use record::{NaturalKey, TimeSeriesRecord, RESERVED_COLUMNS};
pub use report::{Anomaly, BatchFailure, BatchOutcome, ReconcileStatus, ReconciliationReport};
pub use summary::{UpsertOutcome, WriteSummary};

/// Dataset names known to the core. Each maps to one sink per target alias.
pub mod datasets {
    pub const DAILY_BARS: &str = "daily_bars";
    pub const MINUTE_BARS: &str = "minute_bars";
    pub const FUNDAMENTALS: &str = "fundamentals";
    pub const INDICATORS: &str = "indicators";
}

/// Frequency tokens used as the `granularity` part of the natural key.
pub mod granularity {
    pub const DAILY: &str = "1d";
    pub const MINUTE: &str = "1m";
    pub const QUARTERLY: &str = "1q";
}
