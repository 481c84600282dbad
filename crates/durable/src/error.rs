//! Error taxonomy shared by every layer of the engine
//!
//! Each failure that crosses the client boundary is classified into exactly one
//! [`ErrorKind`]. Layer-specific errors (`StoreError`, `ExecutorError`,
//! [`WorkflowError`](crate::workflow::WorkflowError), ...) expose a `kind()`
//! accessor that maps onto it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Business-logic failure raised by activity or workflow code
    Application,
    /// Schedule-to-start, start-to-close or heartbeat timeout exceeded
    Timeout,
    /// Cooperative cancellation was observed
    Cancelled,
    /// Replay diverged from recorded history
    NonDeterminism,
    /// History append hit an already-recorded event id
    DuplicateEvent,
}

impl ErrorKind {
    /// Whether the orchestrator may retry failures of this kind
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Application | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Application => "application_error",
            Self::Timeout => "timeout_error",
            Self::Cancelled => "cancelled_error",
            Self::NonDeterminism => "non_determinism_error",
            Self::DuplicateEvent => "duplicate_event_error",
        };
        f.write_str(name)
    }
}

/// Replay produced a command that does not match the recorded history
///
/// This is fatal for the execution: it is halted and never retried
/// automatically. An operator has to fix the workflow code (or reset the
/// history) before it can make progress again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("non-deterministic replay at event {sequence_no}: history recorded {recorded}, workflow produced {produced}")]
pub struct NonDeterminismError {
    /// Sequence number of the history event that failed to match
    pub sequence_no: u64,
    /// Description of the recorded event
    pub recorded: String,
    /// Description of what replay produced instead
    pub produced: String,
}

impl NonDeterminismError {
    pub fn new(sequence_no: u64, recorded: impl Into<String>, produced: impl Into<String>) -> Self {
        Self {
            sequence_no,
            recorded: recorded.into(),
            produced: produced.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Application.to_string(), "application_error");
        assert_eq!(ErrorKind::NonDeterminism.to_string(), "non_determinism_error");
    }

    #[test]
    fn test_error_kind_retryable() {
        assert!(ErrorKind::Application.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::NonDeterminism.is_retryable());
    }

    #[test]
    fn test_non_determinism_message() {
        let err = NonDeterminismError::new(4, "activity_scheduled(seq=1, greet)", "start_timer(seq=1)");
        let msg = err.to_string();
        assert!(msg.contains("event 4"));
        assert!(msg.contains("greet"));
    }
}
