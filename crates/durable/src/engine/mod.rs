//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor`, which ties the history
//! store, the replay engine and the task orchestrator together:
//!
//! - evaluation passes, dispatch and run lifecycle
//! - client operations (start, signal, query, update, cancel)
//! - recovery of running executions after a restart

mod config;
mod executor;
mod gateway;
mod locks;
mod recovery;
mod registry;

pub use config::ExecutorConfig;
pub use executor::{ExecutorError, WorkflowExecutor, WorkflowExecutorBuilder};
pub use gateway::UpdateStage;
pub use locks::ExecutionLocks;
pub use registry::{RegistryError, WorkflowFactory, WorkflowRegistry};
