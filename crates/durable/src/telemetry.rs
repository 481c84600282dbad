// Tracing setup
//
// Installs a console subscriber for binaries and tests that embed the engine.
// The library itself only emits `tracing` events.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Configuration for the console subscriber
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log filter (e.g., "info", "ledgerflow_durable=debug")
    pub log_filter: Option<String>,
    /// Whether to print the event target
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            with_target: true,
        }
    }
}

impl TracingConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter (default: "info")
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            ..Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global subscriber
///
/// Returns false if a subscriber was already installed.
///
/// ```ignore
/// use ledgerflow_durable::telemetry::{init_tracing, TracingConfig};
///
/// init_tracing(TracingConfig::from_env());
/// ```
pub fn init_tracing(config: TracingConfig) -> bool {
    let layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(config.filter());

    tracing_subscriber::registry().with(layer).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TracingConfig::default();
        assert!(config.log_filter.is_none());
        assert!(config.with_target);
    }

    #[test]
    fn test_invalid_filter_falls_back() {
        let config = TracingConfig {
            log_filter: Some("[[not a filter".to_string()),
            with_target: false,
        };
        assert_eq!(config.filter().to_string(), "info");
    }
}
