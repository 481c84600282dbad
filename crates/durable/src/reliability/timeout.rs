//! Activity timeout enforcement
//!
//! Three limits apply to every activity attempt:
//! - schedule-to-start: how long an attempt may wait for a concurrency permit
//! - start-to-close: how long a started attempt may run
//! - heartbeat: the longest allowed gap between heartbeats, when configured
//!
//! All three surface as retryable [`ActivityError::timeout`] failures.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityError, HeartbeatPayload};

/// Which timeout fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    ScheduleToStart,
    StartToClose,
    Heartbeat,
}

impl fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ScheduleToStart => "schedule-to-start",
            Self::StartToClose => "start-to-close",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// Limits applied to a running attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTimeouts {
    pub start_to_close: Duration,
    pub heartbeat: Option<Duration>,
}

/// Wait for a concurrency permit, failing after `limit`
pub async fn acquire_within(
    permits: Arc<Semaphore>,
    limit: Duration,
) -> Result<OwnedSemaphorePermit, ActivityError> {
    match tokio::time::timeout(limit, permits.acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(ActivityError::non_retryable("activity dispatcher is shut down")),
        Err(_) => Err(ActivityError::timeout(TimeoutType::ScheduleToStart)),
    }
}

/// Drive one attempt to completion under its timeouts
///
/// The attempt future is dropped as soon as a limit is exceeded or `cancel`
/// fires. Every received heartbeat pushes the heartbeat deadline forward.
pub async fn run_attempt<F>(
    attempt: F,
    limits: AttemptTimeouts,
    heartbeats: &mut mpsc::Receiver<HeartbeatPayload>,
    cancel: &CancellationToken,
) -> Result<Value, ActivityError>
where
    F: Future<Output = Result<Value, ActivityError>>,
{
    tokio::pin!(attempt);

    let close_deadline = Instant::now() + limits.start_to_close;
    let mut heartbeat_deadline = limits.heartbeat.map(|t| Instant::now() + t);
    let mut heartbeats_open = true;

    loop {
        let beat_deadline = heartbeat_deadline.unwrap_or(close_deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ActivityError::cancelled()),
            result = &mut attempt => return result,
            _ = tokio::time::sleep_until(close_deadline) => {
                return Err(ActivityError::timeout(TimeoutType::StartToClose));
            }
            _ = tokio::time::sleep_until(beat_deadline), if heartbeat_deadline.is_some() => {
                return Err(ActivityError::timeout(TimeoutType::Heartbeat));
            }
            beat = heartbeats.recv(), if heartbeats_open => match beat {
                Some(_) => {
                    heartbeat_deadline = limits.heartbeat.map(|t| Instant::now() + t);
                }
                None => heartbeats_open = false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(start_to_close_ms: u64, heartbeat_ms: Option<u64>) -> AttemptTimeouts {
        AttemptTimeouts {
            start_to_close: Duration::from_millis(start_to_close_ms),
            heartbeat: heartbeat_ms.map(Duration::from_millis),
        }
    }

    #[tokio::test]
    async fn test_completes_within_limits() {
        let (_tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let result = run_attempt(
            async { Ok(Value::from(7)) },
            limits(1_000, None),
            &mut rx,
            &cancel,
        )
        .await;
        assert_eq!(result.unwrap(), Value::from(7));
    }

    #[tokio::test]
    async fn test_start_to_close_timeout() {
        let (_tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let result = run_attempt(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            },
            limits(50, None),
            &mut rx,
            &cancel,
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(
            err.kind,
            crate::activity::ActivityErrorKind::Timeout(TimeoutType::StartToClose)
        );
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_missing_heartbeat_times_out() {
        let (_tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let err = run_attempt(
            std::future::pending(),
            limits(5_000, Some(50)),
            &mut rx,
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.kind,
            crate::activity::ActivityErrorKind::Timeout(TimeoutType::Heartbeat)
        );
    }

    #[tokio::test]
    async fn test_heartbeats_keep_attempt_alive() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let work = async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tx.send(HeartbeatPayload { details: None }).await.ok();
            }
            Ok(Value::from("done"))
        };
        let result = run_attempt(work, limits(5_000, Some(60)), &mut rx, &cancel).await;
        assert_eq!(result.unwrap(), Value::from("done"));
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let (_tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_attempt(std::future::pending(), limits(5_000, None), &mut rx, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_schedule_to_start_timeout() {
        let permits = Arc::new(Semaphore::new(1));
        let _held = permits.clone().acquire_owned().await.unwrap();
        let err = acquire_within(permits, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(
            err.kind,
            crate::activity::ActivityErrorKind::Timeout(TimeoutType::ScheduleToStart)
        );
    }
}
