//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow logic
//! - [`Command`] enum for intentions emitted by workflow code
//! - [`HistoryEvent`] enum for persisted events
//! - [`WorkflowError`] for failures with a cause chain

mod command;
mod definition;
mod error;
mod event;

pub use command::{ActivityOptions, ChildWorkflowOptions, Command, ParentClosePolicy, UpdateOutcome};
pub use definition::Workflow;
pub use error::{WorkflowError, WorkflowErrorKind};
pub use event::{HistoryEvent, ParentRef, WorkflowOutcome};
