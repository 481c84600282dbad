//! Reliability primitives applied by the task orchestrator
//!
//! - [`RetryPolicy`]: backoff and retry decisions for failed activity attempts
//! - [`timeout`]: schedule-to-start, start-to-close and heartbeat enforcement

mod retry;
pub mod timeout;

pub(crate) use retry::{duration_millis, option_duration_millis};
pub use retry::{GiveUpReason, RetryDecision, RetryPolicy};
pub use timeout::{AttemptTimeouts, TimeoutType};
