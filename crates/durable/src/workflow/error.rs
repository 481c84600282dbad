//! Workflow-level failures and their cause chain

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::{ActivityError, ActivityErrorKind};
use crate::error::{ErrorKind, NonDeterminismError};

/// What produced a [`WorkflowError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowErrorKind {
    /// Raised by workflow code itself
    Application,
    /// An awaited activity failed after exhausting its retry policy
    ActivityFailed,
    /// An awaited child workflow did not succeed
    ChildWorkflowFailed,
    /// An activity timed out
    Timeout,
    /// Cancellation was observed at a suspension point
    Cancelled,
    /// The execution was forcibly ended
    Terminated,
    /// Replay diverged from history
    NonDeterminism,
}

/// Error raised by or delivered to workflow code
///
/// Errors form a chain through [`cause`](Self::cause). A workflow that
/// propagates a failed activity with `?` fails with a chain like
/// `ActivityFailed -> Application`, and callers awaiting the result see the
/// whole chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    /// Human-readable message
    pub message: String,

    /// Where the error came from
    pub kind: WorkflowErrorKind,

    /// Error code for programmatic handling
    #[serde(default)]
    pub code: Option<String>,

    /// Whether the failure is transient
    #[serde(default)]
    pub retryable: bool,

    /// Additional structured details
    #[serde(default)]
    pub details: Option<Value>,

    /// The error this one wraps
    #[serde(default)]
    pub cause: Option<Box<WorkflowError>>,
}

impl WorkflowError {
    /// Create a non-retryable application error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: WorkflowErrorKind::Application,
            code: None,
            retryable: false,
            details: None,
            cause: None,
        }
    }

    /// Create a retryable application error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(message)
        }
    }

    /// Cancellation observed by an await point
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            kind: WorkflowErrorKind::Cancelled,
            ..Self::new(reason)
        }
    }

    /// The execution was terminated from outside
    pub fn terminated(reason: impl Into<String>) -> Self {
        Self {
            kind: WorkflowErrorKind::Terminated,
            ..Self::new(reason)
        }
    }

    /// Wrap a terminal activity failure
    pub fn activity_failed(activity_type: &str, seq: u32, error: &ActivityError) -> Self {
        let cause_kind = match error.kind {
            ActivityErrorKind::Application => WorkflowErrorKind::Application,
            ActivityErrorKind::Timeout(_) => WorkflowErrorKind::Timeout,
            ActivityErrorKind::Cancelled => WorkflowErrorKind::Cancelled,
        };
        let cause = Self {
            message: error.message.clone(),
            kind: cause_kind,
            code: error.error_type.clone(),
            retryable: error.retryable,
            details: error.details.clone(),
            cause: None,
        };
        Self {
            message: format!("activity '{activity_type}' (seq {seq}) failed"),
            kind: WorkflowErrorKind::ActivityFailed,
            code: None,
            retryable: false,
            details: None,
            cause: Some(Box::new(cause)),
        }
    }

    /// Wrap the failure of a child workflow
    pub fn child_failed(workflow_type: &str, workflow_id: &str, error: WorkflowError) -> Self {
        Self {
            message: format!("child workflow '{workflow_type}' ({workflow_id}) failed"),
            kind: WorkflowErrorKind::ChildWorkflowFailed,
            code: None,
            retryable: false,
            details: None,
            cause: Some(Box::new(error)),
        }
    }

    pub(crate) fn non_determinism(err: &NonDeterminismError) -> Self {
        Self {
            kind: WorkflowErrorKind::NonDeterminism,
            ..Self::new(err.to_string())
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach structured details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Wrap another error as the cause of this one
    pub fn with_cause(mut self, cause: WorkflowError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Whether this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        self.kind == WorkflowErrorKind::Cancelled
    }

    /// The innermost error of the chain
    pub fn root_cause(&self) -> &WorkflowError {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }

    /// Iterate over this error and all of its causes, outermost first
    pub fn chain(&self) -> impl Iterator<Item = &WorkflowError> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }

    /// Taxonomy classification, taken from the root cause
    pub fn error_kind(&self) -> ErrorKind {
        match self.root_cause().kind {
            WorkflowErrorKind::Timeout => ErrorKind::Timeout,
            WorkflowErrorKind::Cancelled | WorkflowErrorKind::Terminated => ErrorKind::Cancelled,
            WorkflowErrorKind::NonDeterminism => ErrorKind::NonDeterminism,
            WorkflowErrorKind::Application
            | WorkflowErrorKind::ActivityFailed
            | WorkflowErrorKind::ChildWorkflowFailed => ErrorKind::Application,
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkflowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_code("SERIALIZATION")
    }
}
