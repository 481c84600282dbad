//! History events
//!
//! The event history of an execution is an append-only list of these events.
//! Everything the replay engine knows about an execution is derived from it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ActivityOptions, ChildWorkflowOptions, UpdateOutcome, WorkflowError};
use crate::activity::ActivityError;
use crate::persistence::ExecutionStatus;
use crate::reliability::duration_millis;

/// Link from a child execution back to the parent operation awaiting it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentRef {
    pub workflow_id: String,
    pub run_id: Uuid,
    /// Sequence id of the child operation in the parent
    pub seq: u32,
}

/// How a run ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Succeeded { result: Value },
    Failed { error: WorkflowError },
    Cancelled { reason: String },
    Terminated { reason: String },
}

impl WorkflowOutcome {
    /// Store status matching this outcome
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Succeeded { .. } => ExecutionStatus::Completed,
            Self::Failed { .. } => ExecutionStatus::Failed,
            Self::Cancelled { .. } => ExecutionStatus::Cancelled,
            Self::Terminated { .. } => ExecutionStatus::Terminated,
        }
    }

    /// Result and error recorded on the closed run
    pub fn result_and_error(&self) -> (Option<Value>, Option<WorkflowError>) {
        match self {
            Self::Succeeded { result } => (Some(result.clone()), None),
            Self::Failed { error } => (None, Some(error.clone())),
            Self::Cancelled { reason } => (None, Some(WorkflowError::cancelled(reason))),
            Self::Terminated { reason } => (None, Some(WorkflowError::terminated(reason))),
        }
    }

    pub fn into_result(self) -> Result<Value, WorkflowError> {
        match self {
            Self::Succeeded { result } => Ok(result),
            Self::Failed { error } => Err(error),
            Self::Cancelled { reason } => Err(WorkflowError::cancelled(reason)),
            Self::Terminated { reason } => Err(WorkflowError::terminated(reason)),
        }
    }
}

/// Events recorded in an execution's history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    // =========================================================================
    // Run lifecycle
    // =========================================================================
    /// First event of every run
    WorkflowStarted {
        workflow_type: String,
        input: Value,
        #[serde(default)]
        parent: Option<ParentRef>,
        /// Run this one continues, if created by continue-as-new
        #[serde(default)]
        continued_from: Option<Uuid>,
    },

    WorkflowCancelRequested {
        reason: String,
    },

    /// Terminal event for completion, failure, cancellation or termination
    WorkflowCompleted {
        outcome: WorkflowOutcome,
    },

    /// Terminal event handing over to a successor run
    WorkflowContinuedAsNew {
        new_run_id: Uuid,
        input: Value,
    },

    // =========================================================================
    // Activities
    // =========================================================================
    ActivityScheduled {
        seq: u32,
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    },

    ActivityCompleted {
        seq: u32,
        result: Value,
        attempts: u32,
    },

    /// Retries exhausted or the failure was not retryable
    ActivityFailed {
        seq: u32,
        error: ActivityError,
        attempts: u32,
    },

    ActivityCancelRequested {
        seq: u32,
    },

    // =========================================================================
    // Timers
    // =========================================================================
    TimerStarted {
        seq: u32,
        #[serde(with = "duration_millis")]
        duration: Duration,
        fire_at: DateTime<Utc>,
    },

    TimerFired {
        seq: u32,
    },

    TimerCancelled {
        seq: u32,
    },

    // =========================================================================
    // External interaction
    // =========================================================================
    SignalReceived {
        name: String,
        payload: Value,
    },

    /// Update passed validation; its handler starts on this event
    UpdateAccepted {
        update_id: String,
        name: String,
        args: Value,
    },

    UpdateCompleted {
        update_id: String,
        outcome: UpdateOutcome,
    },

    // =========================================================================
    // Child workflows
    // =========================================================================
    ChildWorkflowStarted {
        seq: u32,
        workflow_id: String,
        run_id: Uuid,
        workflow_type: String,
        input: Value,
        options: ChildWorkflowOptions,
    },

    ChildWorkflowCompleted {
        seq: u32,
        outcome: WorkflowOutcome,
    },

    ChildWorkflowCancelRequested {
        seq: u32,
    },
}

impl HistoryEvent {
    /// Stable snake_case name, stored alongside the payload
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCancelRequested { .. } => "workflow_cancel_requested",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowContinuedAsNew { .. } => "workflow_continued_as_new",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::ActivityCancelRequested { .. } => "activity_cancel_requested",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
            Self::SignalReceived { .. } => "signal_received",
            Self::UpdateAccepted { .. } => "update_accepted",
            Self::UpdateCompleted { .. } => "update_completed",
            Self::ChildWorkflowStarted { .. } => "child_workflow_started",
            Self::ChildWorkflowCompleted { .. } => "child_workflow_completed",
            Self::ChildWorkflowCancelRequested { .. } => "child_workflow_cancel_requested",
        }
    }

    /// Whether the event was produced by a workflow command
    ///
    /// Command events are matched against re-emitted commands during replay.
    /// A termination is recorded from outside, so it is not one of them.
    pub fn is_command_event(&self) -> bool {
        match self {
            Self::WorkflowCompleted { outcome } => {
                !matches!(outcome, WorkflowOutcome::Terminated { .. })
            }
            Self::ActivityScheduled { .. }
            | Self::ActivityCancelRequested { .. }
            | Self::TimerStarted { .. }
            | Self::TimerCancelled { .. }
            | Self::UpdateCompleted { .. }
            | Self::ChildWorkflowStarted { .. }
            | Self::ChildWorkflowCancelRequested { .. }
            | Self::WorkflowContinuedAsNew { .. } => true,
            _ => false,
        }
    }

    /// Whether the event closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowContinuedAsNew { .. }
        )
    }

    /// Status, result and error the run closes with when this event is appended
    pub fn closing_status(&self) -> Option<(ExecutionStatus, Option<Value>, Option<WorkflowError>)> {
        match self {
            Self::WorkflowCompleted { outcome } => {
                let (result, error) = outcome.result_and_error();
                Some((outcome.status(), result, error))
            }
            Self::WorkflowContinuedAsNew { .. } => Some((ExecutionStatus::ContinuedAsNew, None, None)),
            _ => None,
        }
    }

    /// Sequence id of the pending operation this event refers to
    pub fn seq(&self) -> Option<u32> {
        match self {
            Self::ActivityScheduled { seq, .. }
            | Self::ActivityCompleted { seq, .. }
            | Self::ActivityFailed { seq, .. }
            | Self::ActivityCancelRequested { seq }
            | Self::TimerStarted { seq, .. }
            | Self::TimerFired { seq }
            | Self::TimerCancelled { seq }
            | Self::ChildWorkflowStarted { seq, .. }
            | Self::ChildWorkflowCompleted { seq, .. }
            | Self::ChildWorkflowCancelRequested { seq } => Some(*seq),
            _ => None,
        }
    }

    /// Identifying fields, used in determinism errors
    pub fn describe(&self) -> String {
        match self {
            Self::ActivityScheduled {
                seq, activity_type, ..
            } => format!("{}(seq={seq}, {activity_type})", self.kind()),
            Self::ChildWorkflowStarted {
                seq,
                workflow_type,
                workflow_id,
                ..
            } => format!("{}(seq={seq}, {workflow_type}, {workflow_id})", self.kind()),
            Self::UpdateCompleted { update_id, .. } | Self::UpdateAccepted { update_id, .. } => {
                format!("{}({update_id})", self.kind())
            }
            Self::WorkflowCompleted { outcome } => {
                format!("{}({})", self.kind(), outcome.status())
            }
            other => match other.seq() {
                Some(seq) => format!("{}(seq={seq})", other.kind()),
                None => other.kind().to_string(),
            },
        }
    }
}
