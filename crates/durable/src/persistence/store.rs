//! HistoryStore trait definition

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::codec::event_ids;
use crate::workflow::{HistoryEvent, ParentRef, WorkflowError};

/// Identity of one workflow execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId {
    /// Caller-chosen id, shared by every run of a continue-as-new chain
    pub workflow_id: String,
    /// Engine-assigned id of this run
    pub run_id: Uuid,
}

impl ExecutionId {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// No run exists for the workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow already running: {0}")]
    WorkflowAlreadyRunning(String),

    /// The event id was already recorded; the append is a no-op
    #[error("duplicate event {event_id} (recorded at sequence {sequence_no})")]
    DuplicateEvent { event_id: String, sequence_no: u64 },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    #[error("execution is closed: {0}")]
    ExecutionClosed(ExecutionId),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateEvent { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Terminated,
    ContinuedAsNew,
    /// Stopped by a non-determinism error; needs operator attention
    Halted,
}

impl ExecutionStatus {
    /// Whether the run accepts no further events
    pub fn is_closed(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Terminated => "terminated",
            Self::ContinuedAsNew => "continued_as_new",
            Self::Halted => "halted",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "terminated" => Ok(Self::Terminated),
            "continued_as_new" => Ok(Self::ContinuedAsNew),
            "halted" => Ok(Self::Halted),
            other => Err(StoreError::Serialization(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// Parameters for creating a run
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: ExecutionId,
    pub workflow_type: String,
    pub input: Value,
    pub parent: Option<ParentRef>,
    /// Run this one continues, if created by continue-as-new
    pub continued_from: Option<Uuid>,
}

impl NewExecution {
    /// The `WorkflowStarted` event recorded at sequence 1
    pub fn started_event(&self) -> NewEvent {
        NewEvent::new(
            event_ids::WORKFLOW_STARTED,
            HistoryEvent::WorkflowStarted {
                workflow_type: self.workflow_type.clone(),
                input: self.input.clone(),
                parent: self.parent.clone(),
                continued_from: self.continued_from,
            },
        )
    }
}

/// Stored metadata of a run
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    pub id: ExecutionId,
    pub workflow_type: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub parent: Option<ParentRef>,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// An event waiting to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// De-duplication key, unique within the execution
    pub event_id: String,
    pub event: HistoryEvent,
}

impl NewEvent {
    pub fn new(event_id: impl Into<String>, event: HistoryEvent) -> Self {
        Self {
            event_id: event_id.into(),
            event,
        }
    }
}

/// A recorded history event
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Position in the history, starting at 1
    pub sequence_no: u64,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: HistoryEvent,
}

impl EventRecord {
    /// Tag of the event, stored next to the payload
    pub fn event_kind(&self) -> &'static str {
        self.event.kind()
    }

    /// Serialized event payload
    pub fn payload_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(&self.event)?)
    }

    /// Rebuild a record from its stored columns
    pub fn decode(
        sequence_no: u64,
        event_id: String,
        event_kind: &str,
        payload: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let event: HistoryEvent = serde_json::from_slice(payload)?;
        if event.kind() != event_kind {
            return Err(StoreError::Serialization(format!(
                "event {sequence_no} is tagged {event_kind} but decodes as {}",
                event.kind()
            )));
        }
        Ok(Self {
            sequence_no,
            event_id,
            timestamp,
            event,
        })
    }
}

/// Append-only event history per execution
///
/// # Guarantees
///
/// - `append_events` is atomic per batch and durable before it returns
/// - sequence numbers are dense and start at 1
/// - an event id already present in the execution's history is rejected with
///   [`StoreError::DuplicateEvent`] and nothing from the batch is written; this
///   check runs before the optimistic sequence check
/// - a closed execution accepts no further events; appending a terminal event
///   closes the run in the same atomic step
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    // =========================================================================
    // Executions
    // =========================================================================

    /// Create a run and make it the current run of its workflow id
    ///
    /// The run's `WorkflowStarted` event is written as sequence 1 together
    /// with the run, so no other event can precede it. Fails with
    /// `WorkflowAlreadyRunning` if the current run is still open.
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionInfo, StoreError>;

    /// Latest run of a workflow id
    async fn current_run(&self, workflow_id: &str) -> Result<ExecutionId, StoreError>;

    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    async fn list_executions(&self, status: ExecutionStatus) -> Result<Vec<ExecutionId>, StoreError>;

    // =========================================================================
    // History
    // =========================================================================

    /// Append a batch of events, returning the sequence number of the last one
    ///
    /// With `expected_sequence` set, the batch is only written if the first
    /// event would receive exactly that sequence number.
    async fn append_events(
        &self,
        id: &ExecutionId,
        expected_sequence: Option<u64>,
        events: Vec<NewEvent>,
    ) -> Result<u64, StoreError>;

    /// Events with `sequence_no >= from_seq`, in order
    async fn read(&self, id: &ExecutionId, from_seq: u64) -> Result<Vec<EventRecord>, StoreError>;

    /// Append a single event at the end of the history
    async fn append(&self, id: &ExecutionId, event: NewEvent) -> Result<u64, StoreError> {
        self.append_events(id, None, vec![event]).await
    }
}

/// Shared stores, so several executors can run over one history
#[async_trait]
impl<S: HistoryStore + ?Sized> HistoryStore for Arc<S> {
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError> {
        (**self).create_execution(execution).await
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionInfo, StoreError> {
        (**self).get_execution(id).await
    }

    async fn current_run(&self, workflow_id: &str) -> Result<ExecutionId, StoreError> {
        (**self).current_run(workflow_id).await
    }

    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        (**self).update_status(id, status, result, error).await
    }

    async fn list_executions(&self, status: ExecutionStatus) -> Result<Vec<ExecutionId>, StoreError> {
        (**self).list_executions(status).await
    }

    async fn append_events(
        &self,
        id: &ExecutionId,
        expected_sequence: Option<u64>,
        events: Vec<NewEvent>,
    ) -> Result<u64, StoreError> {
        (**self).append_events(id, expected_sequence, events).await
    }

    async fn read(&self, id: &ExecutionId, from_seq: u64) -> Result<Vec<EventRecord>, StoreError> {
        (**self).read(id, from_seq).await
    }
}
