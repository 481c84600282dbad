//! Deterministic replay engine
//!
//! Every evaluation pass rebuilds an execution's in-memory state by running
//! the workflow from the start against its recorded history:
//!
//! ```text
//!   history ──▶ ReplayMachine::apply ──▶ resolve pending operations
//!                      │                          │
//!                      │ command events           ▼
//!                      ▼                  poll workflow futures
//!               verify against ◀── queued ◀── (main, then update
//!               emitted commands   commands    handlers) until quiet
//! ```
//!
//! Commands still queued after the last event are the pass's new work.

mod context;
mod continuation;
mod machine;
mod state;

use serde_json::Value;

pub use context::{
    CancelledFuture, ConditionFuture, ContinueAsNewFuture, HandlersFinishedFuture,
    OperationFuture, WorkflowContext, WorkflowInfo,
};
pub use continuation::{ContinuationManager, ContinuationState};
pub use machine::{AnyExecution, ReplayMachine};

use crate::engine::{RegistryError, WorkflowRegistry};
use crate::error::NonDeterminismError;
use crate::persistence::{EventRecord, ExecutionId};
use crate::workflow::{ActivityOptions, Command, WorkflowError};

/// Per-execution settings for a replay
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub execution: ExecutionId,
    /// History length at which continue-as-new is suggested
    pub continue_as_new_threshold: u64,
    /// Options for activities scheduled without explicit options
    pub default_activity_options: ActivityOptions,
}

/// Error type for replay
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    NonDeterminism(#[from] NonDeterminismError),

    /// A recorded payload does not fit the workflow's types
    #[error("invalid payload at event {sequence_no}: {message}")]
    InvalidPayload { sequence_no: u64, message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result of replaying a full history
pub struct ReplaySnapshot {
    /// Commands emitted after the last recorded event
    pub commands: Vec<Command>,
    execution: Box<dyn AnyExecution>,
}

impl ReplaySnapshot {
    pub fn is_finished(&self) -> bool {
        self.execution.is_finished()
    }

    pub fn history_length(&self) -> u64 {
        self.execution.history_length()
    }

    pub fn query(&self, name: &str, args: Value) -> Result<Value, WorkflowError> {
        self.execution.query(name, args)
    }

    pub fn validate_update(&self, name: &str, args: &Value) -> Result<(), WorkflowError> {
        self.execution.validate_update(name, args)
    }
}

impl std::fmt::Debug for ReplaySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplaySnapshot")
            .field("workflow_type", &self.execution.workflow_type())
            .field("history_length", &self.history_length())
            .field("finished", &self.is_finished())
            .field("commands", &self.commands)
            .finish()
    }
}

/// Replay `records` from the start and collect the resulting state
pub fn replay_history(
    registry: &WorkflowRegistry,
    workflow_type: &str,
    config: ReplayConfig,
    records: &[EventRecord],
) -> Result<ReplaySnapshot, ReplayError> {
    let mut execution = registry.create(workflow_type, config)?;
    for record in records {
        execution.apply(record)?;
    }
    let commands = execution.take_commands();
    Ok(ReplaySnapshot {
        commands,
        execution,
    })
}
