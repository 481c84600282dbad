//! Activity dispatch with retries and timeouts

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::OrchestratorEvent;
use crate::activity::{ActivityContext, ActivityError, ActivityExecutor, ActivityTask};
use crate::persistence::ExecutionId;
use crate::reliability::timeout::{acquire_within, run_attempt};
use crate::reliability::RetryDecision;
use crate::workflow::ActivityOptions;

/// Heartbeats buffered per running attempt
const HEARTBEAT_BUFFER: usize = 16;

type InFlightKey = (ExecutionId, u32);

/// Cancellation handle of one dispatch, tagged so a finished task only
/// removes its own entry
type InFlightEntry = (u64, CancellationToken);

/// Runs scheduled activities and reports their final outcome
///
/// Each scheduled activity gets one task that loops over attempts:
///
/// 1. wait for a concurrency permit (schedule-to-start timeout)
/// 2. run the attempt under its start-to-close and heartbeat timeouts
/// 3. on failure consult the retry policy, sleep, and go again
///
/// Only the final outcome is sent on the events channel, together with the
/// number of attempts made. A cancelled activity reports nothing; the
/// workflow already recorded the cancellation.
#[derive(Clone)]
pub struct ActivityDispatcher {
    executor: Arc<dyn ActivityExecutor>,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashMap<InFlightKey, InFlightEntry>>,
    next_dispatch: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    shutdown: CancellationToken,
}

impl ActivityDispatcher {
    pub fn new(
        executor: Arc<dyn ActivityExecutor>,
        max_concurrent: usize,
        events: mpsc::UnboundedSender<OrchestratorEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(DashMap::new()),
            next_dispatch: Arc::new(AtomicU64::new(0)),
            events,
            shutdown,
        }
    }

    /// Start running an activity unless it is already in flight
    pub fn dispatch(
        &self,
        execution: ExecutionId,
        seq: u32,
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    ) {
        let key = (execution.clone(), seq);
        let (dispatch_id, token) = match self.in_flight.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(execution = %execution, seq, "activity already in flight");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let dispatch_id = self.next_dispatch.fetch_add(1, Ordering::Relaxed);
                let token = self.shutdown.child_token();
                slot.insert((dispatch_id, token.clone()));
                (dispatch_id, token)
            }
        };

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let (outcome, attempts) = dispatcher
                .run_with_retries(&execution, seq, &activity_type, input, &options, &token)
                .await;
            dispatcher
                .in_flight
                .remove_if(&(execution.clone(), seq), |_, (id, _)| *id == dispatch_id);

            if token.is_cancelled() {
                debug!(execution = %execution, seq, activity_type = %activity_type, "activity cancelled");
                return;
            }
            if dispatcher
                .events
                .send(OrchestratorEvent::ActivityResolved {
                    execution,
                    seq,
                    outcome,
                    attempts,
                })
                .is_err()
            {
                debug!(seq, "completion channel closed; dropping activity outcome");
            }
        });
    }

    async fn run_with_retries(
        &self,
        execution: &ExecutionId,
        seq: u32,
        activity_type: &str,
        input: Value,
        options: &ActivityOptions,
        token: &CancellationToken,
    ) -> (Result<Value, ActivityError>, u32) {
        let policy = &options.retry_policy;
        let mut attempt = 1;

        loop {
            let outcome = match acquire_within(self.permits.clone(), options.schedule_to_start_timeout).await {
                Ok(_permit) => {
                    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(HEARTBEAT_BUFFER);
                    let ctx = ActivityContext::new(execution.clone(), seq, attempt, policy.max_attempts)
                        .with_heartbeat(heartbeat_tx)
                        .with_cancellation(token.child_token());
                    let task = ActivityTask {
                        execution: execution.clone(),
                        seq,
                        invocation_id: ctx.invocation_id,
                        activity_type: activity_type.to_string(),
                        input: input.clone(),
                        attempt,
                    };
                    run_attempt(
                        self.executor.execute(task, ctx),
                        options.attempt_timeouts(),
                        &mut heartbeat_rx,
                        token,
                    )
                    .await
                }
                Err(err) => Err(err),
            };

            let error = match outcome {
                Ok(result) => {
                    debug!(execution = %execution, seq, activity_type, attempt, "activity completed");
                    return (Ok(result), attempt);
                }
                Err(_) if token.is_cancelled() => {
                    return (Err(ActivityError::cancelled()), attempt);
                }
                Err(error) => error,
            };

            match policy.decide(attempt, &error) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        execution = %execution,
                        seq,
                        activity_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "activity attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return (Err(ActivityError::cancelled()), attempt),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RetryDecision::GiveUp(reason) => {
                    warn!(
                        execution = %execution,
                        seq,
                        activity_type,
                        attempt,
                        ?reason,
                        error = %error,
                        "activity failed"
                    );
                    return (Err(error), attempt);
                }
            }
        }
    }

    /// Cancel one running activity; returns false if it was not in flight
    pub fn cancel(&self, execution: &ExecutionId, seq: u32) -> bool {
        match self.in_flight.remove(&(execution.clone(), seq)) {
            Some((_, (_, token))) => {
                token.cancel();
                info!(execution = %execution, seq, "activity cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every running activity of `execution`
    pub fn cancel_all(&self, execution: &ExecutionId) {
        let keys: Vec<InFlightKey> = self
            .in_flight
            .iter()
            .filter(|entry| &entry.key().0 == execution)
            .map(|entry| entry.key().clone())
            .collect();
        for (id, seq) in keys {
            self.cancel(&id, seq);
        }
    }

    /// Number of activities currently running or waiting to retry
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
