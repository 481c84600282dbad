//! Commands emitted by workflow code and the options they carry

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorkflowError;
use crate::reliability::{duration_millis, option_duration_millis, AttemptTimeouts, RetryPolicy};

/// Intentions produced by workflow code during one evaluation pass
///
/// Each command becomes exactly one history event once the pass commits.
/// During replay, re-emitted commands are checked against the recorded
/// events instead (see [`codec`](crate::persistence::codec)).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ScheduleActivity {
        seq: u32,
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    },
    RequestCancelActivity {
        seq: u32,
    },
    StartTimer {
        seq: u32,
        #[serde(with = "duration_millis")]
        duration: Duration,
    },
    CancelTimer {
        seq: u32,
    },
    StartChildWorkflow {
        seq: u32,
        workflow_id: String,
        workflow_type: String,
        input: Value,
        options: ChildWorkflowOptions,
    },
    RequestCancelChildWorkflow {
        seq: u32,
    },
    CompleteUpdate {
        update_id: String,
        outcome: UpdateOutcome,
    },
    CompleteWorkflow {
        result: Value,
    },
    FailWorkflow {
        error: WorkflowError,
    },
    CancelWorkflow {
        reason: String,
    },
    ContinueAsNew {
        input: Value,
    },
}

impl Command {
    /// Short name used in logs and determinism errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ScheduleActivity { .. } => "schedule_activity",
            Self::RequestCancelActivity { .. } => "request_cancel_activity",
            Self::StartTimer { .. } => "start_timer",
            Self::CancelTimer { .. } => "cancel_timer",
            Self::StartChildWorkflow { .. } => "start_child_workflow",
            Self::RequestCancelChildWorkflow { .. } => "request_cancel_child_workflow",
            Self::CompleteUpdate { .. } => "complete_update",
            Self::CompleteWorkflow { .. } => "complete_workflow",
            Self::FailWorkflow { .. } => "fail_workflow",
            Self::CancelWorkflow { .. } => "cancel_workflow",
            Self::ContinueAsNew { .. } => "continue_as_new",
        }
    }

    /// Whether this command closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. }
                | Self::FailWorkflow { .. }
                | Self::CancelWorkflow { .. }
                | Self::ContinueAsNew { .. }
        )
    }

    /// Identifying fields, e.g. `schedule_activity(seq=2, charge_card)`
    pub fn describe(&self) -> String {
        match self {
            Self::ScheduleActivity {
                seq, activity_type, ..
            } => format!("{}(seq={seq}, {activity_type})", self.kind()),
            Self::StartChildWorkflow {
                seq,
                workflow_type,
                workflow_id,
                ..
            } => format!("{}(seq={seq}, {workflow_type}, {workflow_id})", self.kind()),
            Self::RequestCancelActivity { seq }
            | Self::StartTimer { seq, .. }
            | Self::CancelTimer { seq }
            | Self::RequestCancelChildWorkflow { seq } => format!("{}(seq={seq})", self.kind()),
            Self::CompleteUpdate { update_id, .. } => format!("{}({update_id})", self.kind()),
            _ => self.kind().to_string(),
        }
    }
}

/// Result of an update handler, as recorded in history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    Completed { result: Value },
    Failed { error: WorkflowError },
}

impl UpdateOutcome {
    pub fn into_result(self) -> Result<Value, WorkflowError> {
        match self {
            Self::Completed { result } => Ok(result),
            Self::Failed { error } => Err(error),
        }
    }
}

impl From<Result<Value, WorkflowError>> for UpdateOutcome {
    fn from(result: Result<Value, WorkflowError>) -> Self {
        match result {
            Ok(result) => Self::Completed { result },
            Err(error) => Self::Failed { error },
        }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time an attempt may wait before it starts running
    #[serde(with = "duration_millis")]
    pub schedule_to_start_timeout: Duration,

    /// Maximum time for a single attempt
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,

    /// If set, the activity must heartbeat at least this often
    #[serde(with = "option_duration_millis", default)]
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            schedule_to_start_timeout: Duration::from_secs(60),
            start_to_close_timeout: Duration::from_secs(300),
            heartbeat_timeout: None,
        }
    }
}

impl ActivityOptions {
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_start_timeout = timeout;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Require heartbeats at least every `timeout`
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Limits for one running attempt
    pub fn attempt_timeouts(&self) -> AttemptTimeouts {
        AttemptTimeouts {
            start_to_close: self.start_to_close_timeout,
            heartbeat: self.heartbeat_timeout,
        }
    }
}

/// What happens to an open child when its parent run closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParentClosePolicy {
    /// Forcibly end the child
    #[default]
    Terminate,
    /// Leave the child running, untracked
    Abandon,
    /// Ask the child to cancel cooperatively
    RequestCancel,
}

/// Options for starting a child workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChildWorkflowOptions {
    pub parent_close_policy: ParentClosePolicy,
}

impl ChildWorkflowOptions {
    pub fn with_parent_close_policy(mut self, policy: ParentClosePolicy) -> Self {
        self.parent_close_policy = policy;
        self
    }
}
