//! Executor configuration

use std::time::Duration;

use crate::workflow::ActivityOptions;

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard cap on history length; a pass over a longer history fails
    pub max_events_per_execution: u64,

    /// History length at which continue-as-new is suggested to workflow code
    pub continue_as_new_threshold: u64,

    /// Activities running at the same time, across all executions
    pub max_concurrent_activities: usize,

    /// Options for activities scheduled without explicit options
    pub default_activity_options: ActivityOptions,

    /// How long `update` waits for the handler to finish
    pub update_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_execution: 50_000,
            continue_as_new_threshold: 10_000,
            max_concurrent_activities: 100,
            default_activity_options: ActivityOptions::default(),
            update_timeout: Duration::from_secs(60),
        }
    }
}

impl ExecutorConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `LEDGERFLOW_MAX_EVENTS_PER_EXECUTION` (default: 50000)
    /// - `LEDGERFLOW_CONTINUE_AS_NEW_THRESHOLD` (default: 10000)
    /// - `LEDGERFLOW_MAX_CONCURRENT_ACTIVITIES` (default: 100)
    /// - `LEDGERFLOW_UPDATE_TIMEOUT_MS` (default: 60000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_events_per_execution = std::env::var("LEDGERFLOW_MAX_EVENTS_PER_EXECUTION")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_events_per_execution);

        let continue_as_new_threshold = std::env::var("LEDGERFLOW_CONTINUE_AS_NEW_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.continue_as_new_threshold);

        let max_concurrent_activities = std::env::var("LEDGERFLOW_MAX_CONCURRENT_ACTIVITIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_concurrent_activities);

        let update_timeout = std::env::var("LEDGERFLOW_UPDATE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.update_timeout);

        Self {
            max_events_per_execution,
            continue_as_new_threshold,
            max_concurrent_activities,
            update_timeout,
            ..defaults
        }
    }

    pub fn with_max_events_per_execution(mut self, max: u64) -> Self {
        self.max_events_per_execution = max;
        self
    }

    pub fn with_continue_as_new_threshold(mut self, threshold: u64) -> Self {
        self.continue_as_new_threshold = threshold;
        self
    }

    pub fn with_max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max;
        self
    }

    pub fn with_default_activity_options(mut self, options: ActivityOptions) -> Self {
        self.default_activity_options = options;
        self
    }

    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }
}
