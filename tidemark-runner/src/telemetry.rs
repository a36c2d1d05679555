//! Tracing subscriber setup.

use crate::config::PipelineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `filter`.
///
/// Returns false when a subscriber was already installed; the call is then a no-op.
pub fn init_tracing(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

/// `init_tracing` with the `[logging]` filter of `config`.
pub fn init_from_config(config: &PipelineConfig) -> bool {
    init_tracing(config.log_filter())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_noop() {
        init_tracing("info");
        assert!(!init_tracing("debug"));
        assert!(!init_from_config(&PipelineConfig::default()));
    }
}
