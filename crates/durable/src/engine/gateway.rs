//! Client operations: start, signal, query, update, cancel, terminate
//!
//! Signals and cancellation are fire-and-forget: the event is appended and a
//! pass is spawned. Queries replay the stored history and never write.
//! Updates are two-phase: the validator runs against replayed state without
//! writing anything, and only an accepted update is recorded and handled.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::executor::{ExecutorError, WorkflowExecutor};
use crate::persistence::codec::event_ids;
use crate::persistence::{
    EventRecord, ExecutionId, ExecutionInfo, ExecutionStatus, HistoryStore, NewEvent, StoreError,
};
use crate::workflow::{HistoryEvent, UpdateOutcome, Workflow, WorkflowError};

/// Fallback re-check interval while waiting for progress
const PROGRESS_POLL: Duration = Duration::from_millis(250);

/// Lifecycle of an update request
///
/// `Accepted` and `Completed` are read from history. The other stages exist
/// only while the request is being handled by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStage {
    /// Received, validator not run yet
    Pending,
    /// Validator passed, acceptance not yet recorded
    Validated,
    /// `UpdateAccepted` recorded, handler running
    Accepted,
    /// `UpdateCompleted` recorded
    Completed,
    /// Validator refused the request
    Rejected,
}

enum Recorded {
    Completed(UpdateOutcome),
    Accepted,
}

fn recorded_update(records: &[EventRecord], update_id: &str) -> Option<Recorded> {
    let mut found = None;
    for record in records {
        match &record.event {
            HistoryEvent::UpdateAccepted { update_id: id, .. } if id == update_id => {
                found = Some(Recorded::Accepted);
            }
            HistoryEvent::UpdateCompleted {
                update_id: id,
                outcome,
            } if id == update_id => return Some(Recorded::Completed(outcome.clone())),
            _ => {}
        }
    }
    found
}

impl<S: HistoryStore> WorkflowExecutor<S> {
    // =========================================================================
    // Start
    // =========================================================================

    /// Start a workflow and run its first pass
    ///
    /// Fails with `WorkflowAlreadyRunning` if a run of `workflow_id` is open.
    #[instrument(skip(self, input))]
    pub async fn start(
        &self,
        workflow_type: &str,
        input: Value,
        workflow_id: &str,
    ) -> Result<Uuid, ExecutorError> {
        let id = ExecutionId::new(workflow_id, Uuid::now_v7());
        self.create_run(&id, workflow_type, input, None, None).await?;
        info!(%workflow_id, run_id = %id.run_id, "starting new workflow");

        self.run_pass(&id).await?;
        Ok(id.run_id)
    }

    /// Typed variant of [`start`](Self::start)
    pub async fn start_workflow<W: Workflow>(
        &self,
        workflow_id: &str,
        input: W::Input,
    ) -> Result<Uuid, ExecutorError> {
        let input = serde_json::to_value(&input)?;
        self.start(W::TYPE, input, workflow_id).await
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Deliver a signal to the current run; does not wait for processing
    pub async fn signal(&self, workflow_id: &str, name: &str, payload: Value) -> Result<(), ExecutorError> {
        self.signal_with_id(workflow_id, &Uuid::now_v7().to_string(), name, payload)
            .await
    }

    /// Deliver a signal with a caller-chosen request id
    ///
    /// Retrying with the same request id delivers the signal once.
    #[instrument(skip(self, payload))]
    pub async fn signal_with_id(
        &self,
        workflow_id: &str,
        request_id: &str,
        name: &str,
        payload: Value,
    ) -> Result<(), ExecutorError> {
        let id = self.inner.store.current_run(workflow_id).await?;
        let event = NewEvent::new(
            event_ids::signal(request_id),
            HistoryEvent::SignalReceived {
                name: name.to_string(),
                payload,
            },
        );
        match self.inner.store.append(&id, event).await {
            Ok(sequence_no) => {
                debug!(sequence_no, "signal recorded");
                self.trigger(id);
                Ok(())
            }
            Err(StoreError::DuplicateEvent { .. }) => {
                debug!("signal already recorded");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Evaluate a query against the replayed state of the current run
    ///
    /// Works on closed runs as long as their history is retained.
    #[instrument(skip(self, args))]
    pub async fn query(&self, workflow_id: &str, name: &str, args: Value) -> Result<Value, ExecutorError> {
        let id = self.inner.store.current_run(workflow_id).await?;
        let info = self.inner.store.get_execution(&id).await?;
        let records = self.inner.store.read(&id, 1).await?;

        let snapshot = self.replay(&id, &info.workflow_type, &records)?;
        snapshot
            .query(name, args)
            .map_err(|error| ExecutorError::QueryFailed {
                name: name.to_string(),
                error,
            })
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Validate, record and run an update, returning the handler's result
    pub async fn update(&self, workflow_id: &str, name: &str, args: Value) -> Result<Value, ExecutorError> {
        self.update_with_id(workflow_id, &Uuid::now_v7().to_string(), name, args)
            .await
    }

    /// Like [`update`](Self::update) with a caller-chosen update id
    ///
    /// Repeating a call with the same id does not run the handler again; the
    /// caller receives the recorded outcome.
    #[instrument(skip(self, args))]
    pub async fn update_with_id(
        &self,
        workflow_id: &str,
        update_id: &str,
        name: &str,
        args: Value,
    ) -> Result<Value, ExecutorError> {
        let id = self.inner.store.current_run(workflow_id).await?;
        let key = (workflow_id.to_string(), update_id.to_string());

        let accepted = self.accept_update(&id, update_id, name, args).await;
        let recorded = match accepted {
            Ok(recorded) => {
                self.inner.updates.remove(&key);
                recorded
            }
            Err(err) => {
                if matches!(err, ExecutorError::UpdateRejected { .. }) {
                    self.inner.updates.insert(key, UpdateStage::Rejected);
                } else {
                    self.inner.updates.remove(&key);
                }
                return Err(err);
            }
        };

        let outcome = match recorded {
            Some(outcome) => outcome,
            None => {
                self.run_pass(&id).await?;
                self.wait_for_update(&id, update_id).await?
            }
        };
        outcome
            .into_result()
            .map_err(|error| ExecutorError::UpdateFailed {
                update_id: update_id.to_string(),
                error,
            })
    }

    /// Record acceptance unless the update is already known
    ///
    /// Returns the recorded outcome if the update already completed.
    async fn accept_update(
        &self,
        id: &ExecutionId,
        update_id: &str,
        name: &str,
        args: Value,
    ) -> Result<Option<UpdateOutcome>, ExecutorError> {
        let key = (id.workflow_id.clone(), update_id.to_string());
        self.inner.updates.insert(key.clone(), UpdateStage::Pending);

        let _guard = self.inner.locks.acquire(id).await;
        loop {
            let info = self.inner.store.get_execution(id).await?;
            let records = self.inner.store.read(id, 1).await?;
            match recorded_update(&records, update_id) {
                Some(Recorded::Completed(outcome)) => return Ok(Some(outcome)),
                Some(Recorded::Accepted) => return Ok(None),
                None => {}
            }
            if info.status.is_closed() {
                return Err(ExecutorError::WorkflowClosed(id.to_string()));
            }

            let validation = {
                let snapshot = self.replay(id, &info.workflow_type, &records)?;
                if snapshot.is_finished() {
                    return Err(ExecutorError::WorkflowClosed(id.to_string()));
                }
                snapshot.validate_update(name, &args)
            };
            if let Err(error) = validation {
                debug!(update_id, name, error = %error, "update rejected by validator");
                return Err(ExecutorError::UpdateRejected {
                    update_id: update_id.to_string(),
                    error,
                });
            }
            self.inner.updates.insert(key.clone(), UpdateStage::Validated);

            let event = NewEvent::new(
                event_ids::update_accepted(update_id),
                HistoryEvent::UpdateAccepted {
                    update_id: update_id.to_string(),
                    name: name.to_string(),
                    args: args.clone(),
                },
            );
            let expected = records.len() as u64 + 1;
            match self.inner.store.append_events(id, Some(expected), vec![event]).await {
                Ok(sequence_no) => {
                    info!(update_id, name, sequence_no, "update accepted");
                    return Ok(None);
                }
                // history moved since validation; validate again
                Err(StoreError::ConcurrencyConflict { .. }) => continue,
                Err(StoreError::DuplicateEvent { .. }) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn wait_for_update(&self, id: &ExecutionId, update_id: &str) -> Result<UpdateOutcome, ExecutorError> {
        let deadline = Instant::now() + self.inner.config.update_timeout;
        loop {
            let notified = self.inner.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.inner.store.read(id, 1).await?;
            if let Some(Recorded::Completed(outcome)) = recorded_update(&records, update_id) {
                return Ok(outcome);
            }
            let info = self.inner.store.get_execution(id).await?;
            if info.status.is_closed() {
                return Err(ExecutorError::WorkflowClosed(id.to_string()));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ExecutorError::Timeout(format!(
                    "update {update_id} did not complete within {:?}",
                    self.inner.config.update_timeout
                )));
            }
            let _ = tokio::time::timeout(PROGRESS_POLL.min(deadline - now), notified).await;
        }
    }

    /// Stage of an update, if this executor or the history knows it
    pub async fn update_stage(
        &self,
        workflow_id: &str,
        update_id: &str,
    ) -> Result<Option<UpdateStage>, ExecutorError> {
        let id = self.inner.store.current_run(workflow_id).await?;
        let records = self.inner.store.read(&id, 1).await?;
        let stage = match recorded_update(&records, update_id) {
            Some(Recorded::Completed(_)) => Some(UpdateStage::Completed),
            Some(Recorded::Accepted) => Some(UpdateStage::Accepted),
            None => self
                .inner
                .updates
                .get(&(workflow_id.to_string(), update_id.to_string()))
                .map(|stage| *stage),
        };
        Ok(stage)
    }

    // =========================================================================
    // Cancellation and termination
    // =========================================================================

    /// Ask the current run to cancel cooperatively
    ///
    /// Repeated requests are no-ops.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), ExecutorError> {
        let id = self.inner.store.current_run(workflow_id).await?;
        self.request_cancel(&id, reason).await?;
        Ok(())
    }

    /// Forcibly end the current run
    #[instrument(skip(self))]
    pub async fn terminate(&self, workflow_id: &str, reason: &str) -> Result<(), ExecutorError> {
        let id = self.inner.store.current_run(workflow_id).await?;
        if self.terminate_run(&id, reason).await? {
            info!(%workflow_id, run_id = %id.run_id, "workflow terminated");
            Ok(())
        } else {
            Err(ExecutorError::WorkflowClosed(id.to_string()))
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Store record of the current run
    pub async fn describe(&self, workflow_id: &str) -> Result<ExecutionInfo, ExecutorError> {
        let id = self.inner.store.current_run(workflow_id).await?;
        Ok(self.inner.store.get_execution(&id).await?)
    }

    /// History of the current run
    pub async fn history(&self, workflow_id: &str) -> Result<Vec<EventRecord>, ExecutorError> {
        let id = self.inner.store.current_run(workflow_id).await?;
        self.history_of(&id).await
    }

    /// History of a specific run
    pub async fn history_of(&self, id: &ExecutionId) -> Result<Vec<EventRecord>, ExecutorError> {
        Ok(self.inner.store.read(id, 1).await?)
    }

    /// Result of the workflow if it has finished, following continue-as-new
    ///
    /// Returns `Ok(None)` while the chain is still running.
    pub async fn try_result(&self, workflow_id: &str) -> Result<Option<Value>, ExecutorError> {
        let info = self.describe(workflow_id).await?;
        match info.status {
            ExecutionStatus::Running | ExecutionStatus::ContinuedAsNew => Ok(None),
            ExecutionStatus::Completed => Ok(Some(info.result.unwrap_or(Value::Null))),
            status => Err(ExecutorError::WorkflowFailed {
                workflow_id: workflow_id.to_string(),
                error: info
                    .error
                    .unwrap_or_else(|| WorkflowError::new(format!("workflow ended as {status}"))),
            }),
        }
    }

    /// Wait for the workflow's final result, following continue-as-new
    ///
    /// Failed, cancelled, terminated and halted runs surface as
    /// [`ExecutorError::WorkflowFailed`] carrying the full cause chain.
    pub async fn result(&self, workflow_id: &str) -> Result<Value, ExecutorError> {
        loop {
            let notified = self.inner.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_result(workflow_id).await? {
                return Ok(result);
            }
            let _ = tokio::time::timeout(PROGRESS_POLL, notified).await;
        }
    }
}
