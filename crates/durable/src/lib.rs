//! # Ledgerflow Durable Execution Engine
//!
//! An event-sourced workflow engine: workflow code is ordinary async Rust,
//! made durable by recording every decision in an append-only history and
//! rebuilding state by deterministic replay.
//!
//! ## Features
//!
//! - **Event-sourced executions**: history is the single source of truth; every pass replays it
//! - **Determinism checks**: re-emitted commands are verified against recorded events
//! - **Activities**: retries with backoff and jitter, schedule-to-start, start-to-close and heartbeat timeouts
//! - **External interaction**: signals, read-only queries and two-phase updates
//! - **Lifecycle**: durable timers, child workflows, cooperative cancellation and continue-as-new
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (gateway: start/signal/query/update/cancel; passes; close) │
//! └─────────────────────────────────────────────────────────────┘
//!          │ replay                       │ dispatch committed events
//!          ▼                              ▼
//! ┌──────────────────────┐   ┌──────────────────────────────────┐
//! │    ReplayMachine     │   │  ActivityDispatcher TimerService  │
//! │ (workflow futures,   │   │  (retries, timeouts, deadlines)   │
//! │  command emission)   │   └──────────────────────────────────┘
//! └──────────────────────┘                │ OrchestratorEvent
//!          │ read / append                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       HistoryStore                           │
//! │  (in-memory, or PostgreSQL: ledgerflow_history_events)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use ledgerflow_durable::prelude::*;
//!
//! struct Greeter;
//!
//! impl Workflow for Greeter {
//!     const TYPE: &'static str = "greeter";
//!     type Input = Vec<String>;
//!     type Output = Vec<String>;
//!
//!     fn new(_input: &Self::Input) -> Self {
//!         Greeter
//!     }
//!
//!     fn run(ctx: WorkflowContext<Self>, names: Vec<String>) -> BoxFuture<'static, Result<Vec<String>, WorkflowError>> {
//!         Box::pin(async move {
//!             let calls = names.iter().map(|n| ctx.activity("say_hello", json!(n)));
//!             let mut greetings = Vec::new();
//!             for greeting in futures::future::join_all(calls).await {
//!                 greetings.push(serde_json::from_value(greeting?)?);
//!             }
//!             greetings.sort();
//!             Ok(greetings)
//!         })
//!     }
//! }
//! ```

pub mod activity;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod persistence;
pub mod reliability;
pub mod replay;
pub mod telemetry;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, UpdateStage, WorkflowExecutor, WorkflowRegistry,
    };
    pub use crate::error::ErrorKind;
    pub use crate::persistence::{
        HistoryStore, InMemoryHistoryStore, PostgresHistoryStore, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::replay::WorkflowContext;
    pub use crate::workflow::{
        ActivityOptions, ChildWorkflowOptions, ParentClosePolicy, Workflow, WorkflowError,
    };
    pub use futures::future::BoxFuture;
    pub use serde_json::{json, Value};
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityExecutor, ActivityRegistry};
pub use engine::{ExecutorConfig, ExecutorError, UpdateStage, WorkflowExecutor, WorkflowRegistry};
pub use error::{ErrorKind, NonDeterminismError};
pub use persistence::{
    EventRecord, ExecutionId, ExecutionInfo, ExecutionStatus, HistoryStore, InMemoryHistoryStore,
    PostgresHistoryStore, StoreError,
};
pub use reliability::{RetryPolicy, TimeoutType};
pub use replay::{replay_history, ReplaySnapshot, WorkflowContext};
pub use workflow::{
    ActivityOptions, ChildWorkflowOptions, HistoryEvent, ParentClosePolicy, Workflow,
    WorkflowError, WorkflowOutcome,
};
