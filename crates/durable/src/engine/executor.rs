//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Running evaluation passes: replay the history, commit new command events
//! - Dispatching committed events to the activity dispatcher and timer service
//! - Starting child runs and successor runs
//! - Closing runs: status, parent notification and parent-close policies

use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::config::ExecutorConfig;
use super::locks::ExecutionLocks;
use super::registry::{RegistryError, WorkflowRegistry};
use crate::activity::{Activity, ActivityContext, ActivityError, ActivityExecutor, ActivityRegistry};
use crate::error::{ErrorKind, NonDeterminismError};
use crate::orchestrator::{ActivityDispatcher, OpenChild, OrchestratorEvent, PendingWork, TimerService};
use crate::persistence::codec::{self, event_ids};
use crate::persistence::{
    EventRecord, ExecutionId, ExecutionStatus, HistoryStore, NewEvent, NewExecution, StoreError,
};
use crate::replay::{replay_history, ReplayConfig, ReplayError, ReplaySnapshot};
use crate::workflow::{
    Command, HistoryEvent, ParentClosePolicy, ParentRef, Workflow, WorkflowError, WorkflowOutcome,
};

/// How often a pass is retried after losing a race on the history
const MAX_PASS_ATTEMPTS: usize = 16;

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Replay diverged from history; the execution is halted
    #[error(transparent)]
    NonDeterminism(#[from] NonDeterminismError),

    /// A recorded or supplied payload does not fit the workflow's types
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow already running: {0}")]
    WorkflowAlreadyRunning(String),

    /// The execution accepts no further input
    #[error("workflow is closed: {0}")]
    WorkflowClosed(String),

    /// The workflow ended without a result
    #[error("workflow {workflow_id} failed: {error}")]
    WorkflowFailed {
        workflow_id: String,
        error: WorkflowError,
    },

    /// The update validator refused the request; nothing was recorded
    #[error("update {update_id} rejected: {error}")]
    UpdateRejected {
        update_id: String,
        error: WorkflowError,
    },

    /// The update handler returned an error
    #[error("update {update_id} failed: {error}")]
    UpdateFailed {
        update_id: String,
        error: WorkflowError,
    },

    #[error("query {name} failed: {error}")]
    QueryFailed { name: String, error: WorkflowError },

    /// Too many events
    #[error("execution {execution} has too many events ({count} > {limit})")]
    TooManyEvents {
        execution: ExecutionId,
        count: u64,
        limit: u64,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl ExecutorError {
    /// Taxonomy classification of this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(err) if err.is_duplicate() => ErrorKind::DuplicateEvent,
            Self::NonDeterminism(_) => ErrorKind::NonDeterminism,
            Self::WorkflowFailed { error, .. }
            | Self::UpdateRejected { error, .. }
            | Self::UpdateFailed { error, .. }
            | Self::QueryFailed { error, .. } => error.error_kind(),
            Self::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Application,
        }
    }

    fn is_lost_race(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::ConcurrencyConflict { .. } | StoreError::DuplicateEvent { .. })
        )
    }
}

impl From<StoreError> for ExecutorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(workflow_id) => Self::WorkflowNotFound(workflow_id),
            StoreError::ExecutionNotFound(id) => Self::WorkflowNotFound(id.to_string()),
            StoreError::WorkflowAlreadyRunning(workflow_id) => {
                Self::WorkflowAlreadyRunning(workflow_id)
            }
            StoreError::ExecutionClosed(id) => Self::WorkflowClosed(id.to_string()),
            other => Self::Store(other),
        }
    }
}

impl From<ReplayError> for ExecutorError {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::NonDeterminism(err) => Self::NonDeterminism(err),
            ReplayError::Registry(err) => Self::Registry(err),
            ReplayError::InvalidPayload {
                sequence_no,
                message,
            } => Self::InvalidPayload(format!("event {sequence_no}: {message}")),
        }
    }
}

pub(super) struct Inner<S: HistoryStore> {
    pub(super) store: Arc<S>,
    pub(super) registry: WorkflowRegistry,
    pub(super) config: ExecutorConfig,
    pub(super) locks: ExecutionLocks,
    pub(super) activities: ActivityDispatcher,
    pub(super) timers: TimerService,
    /// Woken after every pass and every close
    pub(super) progress: Notify,
    pub(super) updates: dashmap::DashMap<(String, String), super::UpdateStage>,
    shutdown: CancellationToken,
}

impl<S: HistoryStore> Drop for Inner<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Workflow executor
///
/// A cheap-to-clone handle. Every clone drives the same store, registries
/// and background services; the background tasks stop once the last handle
/// is dropped or [`shutdown`](Self::shutdown) is called.
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::prelude::*;
///
/// let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
///     .register_workflow::<Greeter>()
///     .register_activity_fn("say_hello", |_ctx, input| async move {
///         let name: String = serde_json::from_value(input)?;
///         Ok(serde_json::json!(format!("Hello, {name}!")))
///     })
///     .build();
///
/// executor.start_workflow::<Greeter>("greet-1", vec!["user1".into()]).await?;
/// let greetings = executor.result("greet-1").await?;
/// ```
pub struct WorkflowExecutor<S: HistoryStore> {
    pub(super) inner: Arc<Inner<S>>,
}

impl<S: HistoryStore> Clone for WorkflowExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Builder for [`WorkflowExecutor`]
pub struct WorkflowExecutorBuilder<S: HistoryStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    activities: ActivityRegistry,
    activity_executor: Option<Arc<dyn ActivityExecutor>>,
    config: ExecutorConfig,
}

impl<S: HistoryStore> WorkflowExecutorBuilder<S> {
    /// Register a workflow type
    pub fn register_workflow<W: Workflow>(mut self) -> Self {
        self.registry.register::<W>();
        debug!(workflow_type = W::TYPE, "registered workflow type");
        self
    }

    /// Register a typed activity with the built-in activity registry
    pub fn register_activity<A: Activity>(mut self, activity: A) -> Self {
        self.activities.register(activity);
        self
    }

    /// Register a closure activity with the built-in activity registry
    pub fn register_activity_fn<F, Fut>(mut self, activity_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.activities.register_fn(activity_type, f);
        self
    }

    /// Run activities somewhere else than the built-in registry
    pub fn with_activity_executor(mut self, executor: Arc<dyn ActivityExecutor>) -> Self {
        self.activity_executor = Some(executor);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the executor and start its background tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> WorkflowExecutor<S> {
        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let activity_executor = self
            .activity_executor
            .unwrap_or_else(|| Arc::new(self.activities) as Arc<dyn ActivityExecutor>);
        let activities = ActivityDispatcher::new(
            activity_executor,
            self.config.max_concurrent_activities,
            events_tx.clone(),
            shutdown.clone(),
        );
        let timers = TimerService::new(events_tx);

        let inner = Arc::new(Inner {
            store: self.store,
            registry: self.registry,
            config: self.config,
            locks: ExecutionLocks::new(),
            activities,
            timers: timers.clone(),
            progress: Notify::new(),
            updates: dashmap::DashMap::new(),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(timers.run(shutdown.child_token()));
        tokio::spawn(completion_loop(
            Arc::downgrade(&inner),
            events_rx,
            shutdown,
        ));

        info!(
            workflow_types = inner.registry.len(),
            max_concurrent_activities = inner.config.max_concurrent_activities,
            "workflow executor started"
        );
        WorkflowExecutor { inner }
    }
}

/// Record orchestrator outcomes in arrival order
async fn completion_loop<S: HistoryStore>(
    inner: Weak<Inner<S>>,
    mut events: mpsc::UnboundedReceiver<OrchestratorEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        WorkflowExecutor { inner }.record_completion(event).await;
    }
    debug!("completion loop stopped");
}

fn process_pass<S: HistoryStore>(
    executor: WorkflowExecutor<S>,
    id: ExecutionId,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        match executor.run_pass(&id).await {
            // already logged when the execution was halted
            Err(err) if err.kind() == ErrorKind::NonDeterminism => {}
            Err(err) => error!(execution = %id, error = %err, "evaluation pass failed"),
            Ok(()) => {}
        }
    })
}

fn close_child<S: HistoryStore>(
    executor: WorkflowExecutor<S>,
    child: OpenChild,
    reason: String,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Err(err) = executor.close_child(&child, &reason).await {
            warn!(child = %child.execution, error = %err, "parent-close policy failed");
        }
    })
}

impl<S: HistoryStore> WorkflowExecutor<S> {
    pub fn builder(store: S) -> WorkflowExecutorBuilder<S> {
        WorkflowExecutorBuilder {
            store: Arc::new(store),
            registry: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
            activity_executor: None,
            config: ExecutorConfig::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Activities currently running or waiting to retry
    pub fn activities_in_flight(&self) -> usize {
        self.inner.activities.in_flight()
    }

    /// Stop background tasks and cancel running activities
    pub fn shutdown(&self) {
        info!("workflow executor shutting down");
        self.inner.shutdown.cancel();
    }

    // =========================================================================
    // Evaluation passes
    // =========================================================================

    /// Schedule an evaluation pass on a background task
    pub(crate) fn trigger(&self, id: ExecutionId) {
        tokio::spawn(process_pass(self.clone(), id));
    }

    /// Replay the history, commit new commands and dispatch them
    ///
    /// Runs under the execution's lock. A pass that loses a race with a
    /// concurrent append starts over from a fresh read.
    #[instrument(skip(self, id), fields(workflow_id = %id.workflow_id, run_id = %id.run_id))]
    pub(crate) async fn run_pass(&self, id: &ExecutionId) -> Result<(), ExecutorError> {
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let guard = self.inner.locks.acquire(id).await;
            let result = match self.evaluate(id).await {
                Ok(Some(committed)) => {
                    self.dispatch(id, &committed).await;
                    Ok(committed.iter().any(|r| r.event.is_terminal()))
                }
                Ok(None) => Ok(true),
                Err(err) => Err(err),
            };
            drop(guard);

            match result {
                Err(err) if err.is_lost_race() && attempt < MAX_PASS_ATTEMPTS => {
                    debug!(attempt, error = %err, "history moved during pass, retrying");
                }
                Ok(closed) => {
                    if closed {
                        self.inner.locks.release(id);
                    }
                    break Ok(());
                }
                Err(err) => {
                    // the run was halted and is closed
                    if matches!(err, ExecutorError::NonDeterminism(_)) {
                        self.inner.locks.release(id);
                    }
                    break Err(err);
                }
            }
        };
        self.inner.progress.notify_waiters();
        result
    }

    /// One replay of the full history
    ///
    /// Returns the committed records, or `None` if the run is already closed.
    async fn evaluate(&self, id: &ExecutionId) -> Result<Option<Vec<EventRecord>>, ExecutorError> {
        let info = self.inner.store.get_execution(id).await?;
        if info.status.is_closed() {
            return Ok(None);
        }

        let records = self.inner.store.read(id, 1).await?;
        let count = records.len() as u64;
        if count > self.inner.config.max_events_per_execution {
            return Err(ExecutorError::TooManyEvents {
                execution: id.clone(),
                count,
                limit: self.inner.config.max_events_per_execution,
            });
        }

        let commands = match self.replay(id, &info.workflow_type, &records) {
            Ok(snapshot) => snapshot.commands,
            Err(ReplayError::NonDeterminism(err)) => {
                self.halt(id, &err).await?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        if commands.is_empty() {
            debug!(history_length = count, "pass produced no commands");
            return Ok(Some(Vec::new()));
        }
        self.commit(id, count, commands).await.map(Some)
    }

    pub(super) fn replay(
        &self,
        id: &ExecutionId,
        workflow_type: &str,
        records: &[EventRecord],
    ) -> Result<ReplaySnapshot, ReplayError> {
        let config = ReplayConfig {
            execution: id.clone(),
            continue_as_new_threshold: self.inner.config.continue_as_new_threshold,
            default_activity_options: self.inner.config.default_activity_options.clone(),
        };
        replay_history(&self.inner.registry, workflow_type, config, records)
    }

    async fn commit(
        &self,
        id: &ExecutionId,
        history_length: u64,
        commands: Vec<Command>,
    ) -> Result<Vec<EventRecord>, ExecutorError> {
        let now = Utc::now();
        let events: Vec<NewEvent> = commands
            .into_iter()
            .map(|command| codec::encode(command, now))
            .collect();
        let count = events.len() as u64;

        let last = self
            .inner
            .store
            .append_events(id, Some(history_length + 1), events.clone())
            .await?;
        debug!(count, last_sequence = last, "committed command events");

        let first = last + 1 - count;
        Ok(events
            .into_iter()
            .zip(first..)
            .map(|(event, sequence_no)| EventRecord {
                sequence_no,
                event_id: event.event_id,
                timestamp: now,
                event: event.event,
            })
            .collect())
    }

    async fn halt(&self, id: &ExecutionId, err: &NonDeterminismError) -> Result<(), ExecutorError> {
        error!(
            workflow_id = %id.workflow_id,
            run_id = %id.run_id,
            sequence_no = err.sequence_no,
            recorded = %err.recorded,
            produced = %err.produced,
            "non-deterministic replay, halting execution"
        );
        self.inner
            .store
            .update_status(
                id,
                ExecutionStatus::Halted,
                None,
                Some(WorkflowError::non_determinism(err)),
            )
            .await?;
        self.inner.activities.cancel_all(id);
        self.inner.timers.cancel_all(id);
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn dispatch(&self, id: &ExecutionId, records: &[EventRecord]) {
        for record in records {
            if let Err(err) = self.dispatch_event(id, &record.event).await {
                error!(
                    execution = %id,
                    sequence_no = record.sequence_no,
                    event = record.event.kind(),
                    error = %err,
                    "failed to dispatch event"
                );
            }
        }
    }

    /// Hand a committed event to whatever acts on it
    pub(super) async fn dispatch_event(
        &self,
        id: &ExecutionId,
        event: &HistoryEvent,
    ) -> Result<(), ExecutorError> {
        match event {
            HistoryEvent::ActivityScheduled {
                seq,
                activity_type,
                input,
                options,
            } => {
                debug!(execution = %id, seq, activity_type = %activity_type, "dispatching activity");
                self.inner.activities.dispatch(
                    id.clone(),
                    *seq,
                    activity_type.clone(),
                    input.clone(),
                    options.clone(),
                );
            }
            HistoryEvent::ActivityCancelRequested { seq } => {
                self.inner.activities.cancel(id, *seq);
            }
            HistoryEvent::TimerStarted { seq, fire_at, .. } => {
                self.inner.timers.schedule(id.clone(), *seq, *fire_at);
            }
            HistoryEvent::TimerCancelled { seq } => {
                self.inner.timers.cancel(id, *seq);
            }
            HistoryEvent::ChildWorkflowStarted {
                seq,
                workflow_id,
                run_id,
                workflow_type,
                input,
                ..
            } => {
                let child = ExecutionId::new(workflow_id.clone(), *run_id);
                self.start_child(id, *seq, &child, workflow_type, input.clone())
                    .await?;
            }
            HistoryEvent::ChildWorkflowCancelRequested { seq } => {
                let records = self.inner.store.read(id, 1).await?;
                if let Some(child) = PendingWork::find_child(&records, *seq) {
                    self.cancel_chain(&child.workflow_id, "cancelled by parent workflow")
                        .await?;
                }
            }
            HistoryEvent::WorkflowCompleted { outcome } => {
                self.on_closed(id, outcome.clone()).await?;
            }
            HistoryEvent::WorkflowContinuedAsNew { new_run_id, input } => {
                self.on_continued(id, *new_run_id, input.clone()).await?;
            }
            _ => {}
        }
        Ok(())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Create a run together with its start event
    pub(super) async fn create_run(
        &self,
        id: &ExecutionId,
        workflow_type: &str,
        input: Value,
        parent: Option<ParentRef>,
        continued_from: Option<Uuid>,
    ) -> Result<(), ExecutorError> {
        self.inner.registry.check_input(workflow_type, &input)?;
        self.inner
            .store
            .create_execution(NewExecution {
                id: id.clone(),
                workflow_type: workflow_type.to_string(),
                input,
                parent,
                continued_from,
            })
            .await?;
        Ok(())
    }

    /// Like [`create_run`](Self::create_run), but a run that already exists
    /// under the same id counts as created
    async fn ensure_run(
        &self,
        id: &ExecutionId,
        workflow_type: &str,
        input: Value,
        parent: Option<ParentRef>,
        continued_from: Option<Uuid>,
    ) -> Result<(), ExecutorError> {
        match self
            .create_run(id, workflow_type, input, parent, continued_from)
            .await
        {
            Err(ExecutorError::WorkflowAlreadyRunning(workflow_id)) => {
                match self.inner.store.get_execution(id).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(ExecutorError::WorkflowAlreadyRunning(workflow_id)),
                }
            }
            other => other,
        }
    }

    pub(super) async fn start_child(
        &self,
        parent_id: &ExecutionId,
        seq: u32,
        child: &ExecutionId,
        workflow_type: &str,
        input: Value,
    ) -> Result<(), ExecutorError> {
        let parent = ParentRef {
            workflow_id: parent_id.workflow_id.clone(),
            run_id: parent_id.run_id,
            seq,
        };
        match self
            .ensure_run(child, workflow_type, input, Some(parent.clone()), None)
            .await
        {
            Ok(()) => {
                info!(parent = %parent_id, child = %child, workflow_type, "child workflow started");
                self.trigger(child.clone());
                Ok(())
            }
            Err(err) => {
                warn!(parent = %parent_id, child = %child, error = %err, "child workflow could not start");
                let error = WorkflowError::new(format!("child workflow could not start: {err}"))
                    .with_code("CHILD_START_FAILED");
                self.notify_parent(&parent, WorkflowOutcome::Failed { error })
                    .await
            }
        }
    }

    /// Append a cancel request to the current run of `workflow_id`
    ///
    /// Returns false if the run was already asked to cancel.
    pub(super) async fn request_cancel(
        &self,
        id: &ExecutionId,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let event = NewEvent::new(
            event_ids::CANCEL_REQUESTED,
            HistoryEvent::WorkflowCancelRequested {
                reason: reason.to_string(),
            },
        );
        match self.inner.store.append(id, event).await {
            Ok(_) => {
                info!(execution = %id, reason, "workflow cancellation requested");
                self.trigger(id.clone());
                Ok(true)
            }
            Err(StoreError::DuplicateEvent { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn cancel_chain(&self, workflow_id: &str, reason: &str) -> Result<(), ExecutorError> {
        let current = self.inner.store.current_run(workflow_id).await?;
        match self.request_cancel(&current, reason).await {
            Ok(_) | Err(StoreError::ExecutionClosed(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Append a termination and close the run
    ///
    /// Returns false if the run had already closed.
    pub(super) async fn terminate_run(
        &self,
        id: &ExecutionId,
        reason: &str,
    ) -> Result<bool, ExecutorError> {
        let guard = self.inner.locks.acquire(id).await;
        let outcome = WorkflowOutcome::Terminated {
            reason: reason.to_string(),
        };
        let event = NewEvent::new(
            event_ids::WORKFLOW_CLOSED,
            HistoryEvent::WorkflowCompleted {
                outcome: outcome.clone(),
            },
        );
        let appended = match self.inner.store.append(id, event).await {
            Ok(_) => {
                self.on_closed(id, outcome).await?;
                true
            }
            Err(StoreError::DuplicateEvent { .. } | StoreError::ExecutionClosed(_)) => false,
            Err(err) => return Err(err.into()),
        };
        drop(guard);

        self.inner.locks.release(id);
        self.inner.progress.notify_waiters();
        Ok(appended)
    }

    // =========================================================================
    // Closing
    // =========================================================================

    /// Side effects of a run closing; the store already recorded its status
    pub(super) async fn on_closed(
        &self,
        id: &ExecutionId,
        outcome: WorkflowOutcome,
    ) -> Result<(), ExecutorError> {
        info!(workflow_id = %id.workflow_id, run_id = %id.run_id, status = %outcome.status(), "workflow closed");

        let info = self.inner.store.get_execution(id).await?;
        self.release_resources(id).await?;
        if let Some(parent) = info.parent {
            self.notify_parent(&parent, outcome).await?;
        }
        Ok(())
    }

    pub(super) async fn on_continued(
        &self,
        id: &ExecutionId,
        new_run_id: Uuid,
        input: Value,
    ) -> Result<(), ExecutorError> {
        let info = self.inner.store.get_execution(id).await?;
        self.release_resources(id).await?;

        let successor = ExecutionId::new(id.workflow_id.clone(), new_run_id);
        self.ensure_run(
            &successor,
            &info.workflow_type,
            input,
            info.parent,
            Some(id.run_id),
        )
        .await?;
        info!(
            workflow_id = %id.workflow_id,
            run_id = %id.run_id,
            %new_run_id,
            "workflow continued as new"
        );
        self.trigger(successor);
        Ok(())
    }

    /// Cancel in-flight work of a closed run and apply parent-close policies
    async fn release_resources(&self, id: &ExecutionId) -> Result<(), ExecutorError> {
        self.inner.activities.cancel_all(id);
        self.inner.timers.cancel_all(id);

        let records = self.inner.store.read(id, 1).await?;
        for child in PendingWork::from_history(&records).children {
            match child.parent_close_policy {
                ParentClosePolicy::Abandon => {
                    debug!(child = %child.execution, "abandoning open child workflow");
                }
                ParentClosePolicy::Terminate | ParentClosePolicy::RequestCancel => {
                    tokio::spawn(close_child(
                        self.clone(),
                        child,
                        format!("parent workflow {} closed", id.workflow_id),
                    ));
                }
            }
        }
        Ok(())
    }

    pub(super) async fn close_child(
        &self,
        child: &OpenChild,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        let current = self
            .inner
            .store
            .current_run(&child.execution.workflow_id)
            .await?;
        match child.parent_close_policy {
            ParentClosePolicy::Terminate => {
                if self.terminate_run(&current, reason).await? {
                    info!(child = %current, "terminated child of closed parent");
                }
            }
            ParentClosePolicy::RequestCancel => {
                self.cancel_chain(&current.workflow_id, reason).await?;
            }
            ParentClosePolicy::Abandon => {}
        }
        Ok(())
    }

    /// Report a child's final outcome to the operation awaiting it
    pub(super) async fn notify_parent(
        &self,
        parent: &ParentRef,
        outcome: WorkflowOutcome,
    ) -> Result<(), ExecutorError> {
        let parent_id = ExecutionId::new(parent.workflow_id.clone(), parent.run_id);
        let event = NewEvent::new(
            event_ids::child_result(parent.seq),
            HistoryEvent::ChildWorkflowCompleted {
                seq: parent.seq,
                outcome,
            },
        );
        match self.inner.store.append(&parent_id, event).await {
            Ok(_) => self.trigger(parent_id),
            Err(StoreError::DuplicateEvent { .. }) => {}
            Err(StoreError::ExecutionClosed(_)) => {
                debug!(parent = %parent_id, "parent already closed, dropping child outcome");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    // =========================================================================
    // Completions
    // =========================================================================

    async fn record_completion(&self, event: OrchestratorEvent) {
        let (id, new_event) = event.into_new_event();
        let kind = new_event.event.kind();
        match self.inner.store.append(&id, new_event).await {
            Ok(sequence_no) => {
                debug!(execution = %id, event = kind, sequence_no, "recorded completion");
                self.trigger(id);
            }
            Err(StoreError::DuplicateEvent { event_id, .. }) => {
                debug!(execution = %id, event_id = %event_id, "completion already recorded");
            }
            Err(StoreError::ExecutionClosed(_)) => {
                warn!(execution = %id, event = kind, "dropping late completion for closed execution");
            }
            Err(err) => {
                error!(execution = %id, event = kind, error = %err, "failed to record completion");
            }
        }
    }
}
