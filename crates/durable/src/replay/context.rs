//! The handle workflow code uses to reach the engine
//!
//! Every await point is one of the futures below. They never block: when the
//! outcome is not in history yet they return `Pending`, and the replay machine
//! polls again after the next applied event.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::state::{OpRequest, ReplayState};
use crate::activity::Activity;
use crate::workflow::{ActivityOptions, ChildWorkflowOptions, ParentRef, Workflow, WorkflowError};

/// Identity of the running execution, as seen by workflow code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub parent: Option<ParentRef>,
    /// Previous run of a continue-as-new chain
    pub continued_from: Option<Uuid>,
}

/// Deterministic handle passed to [`Workflow::run`] and update handlers
pub struct WorkflowContext<W> {
    state: Arc<Mutex<ReplayState>>,
    workflow: Arc<Mutex<W>>,
}

impl<W> Clone for WorkflowContext<W> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            workflow: Arc::clone(&self.workflow),
        }
    }
}

impl<W: Workflow> WorkflowContext<W> {
    pub(crate) fn new(state: Arc<Mutex<ReplayState>>, workflow: Arc<Mutex<W>>) -> Self {
        Self { state, workflow }
    }

    pub fn info(&self) -> WorkflowInfo {
        self.state.lock().info.clone()
    }

    // =========================================================================
    // Workflow state
    // =========================================================================

    /// Read the workflow state
    ///
    /// The closure must not call back into the context.
    pub fn state<R>(&self, f: impl FnOnce(&W) -> R) -> R {
        f(&self.workflow.lock())
    }

    /// Mutate the workflow state
    pub fn state_mut<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        let result = f(&mut self.workflow.lock());
        self.state.lock().bump();
        result
    }

    // =========================================================================
    // Activities, timers and children
    // =========================================================================

    /// Schedule an activity by type tag with the default options
    pub fn activity(&self, activity_type: impl Into<String>, input: Value) -> OperationFuture<Value> {
        let options = self.state.lock().default_activity_options.clone();
        self.activity_with_options(activity_type, input, options)
    }

    pub fn activity_with_options(
        &self,
        activity_type: impl Into<String>,
        input: Value,
        options: ActivityOptions,
    ) -> OperationFuture<Value> {
        self.operation(OpRequest::Activity {
            activity_type: activity_type.into(),
            input,
            options,
        })
    }

    /// Schedule a typed activity with the default options
    pub fn execute_activity<A: Activity>(&self, input: A::Input) -> OperationFuture<A::Output> {
        let options = self.state.lock().default_activity_options.clone();
        self.execute_activity_with_options::<A>(input, options)
    }

    pub fn execute_activity_with_options<A: Activity>(
        &self,
        input: A::Input,
        options: ActivityOptions,
    ) -> OperationFuture<A::Output> {
        match serde_json::to_value(input) {
            Ok(input) => self.operation(OpRequest::Activity {
                activity_type: A::TYPE.to_string(),
                input,
                options,
            }),
            Err(e) => OperationFuture::failed(self.state.clone(), e.into()),
        }
    }

    /// Durable timer
    pub fn sleep(&self, duration: Duration) -> OperationFuture<()> {
        self.operation(OpRequest::Timer { duration })
    }

    /// Start a child workflow by type tag
    pub fn start_child(
        &self,
        workflow_type: impl Into<String>,
        workflow_id: impl Into<String>,
        input: Value,
        options: ChildWorkflowOptions,
    ) -> OperationFuture<Value> {
        self.operation(OpRequest::Child {
            workflow_type: workflow_type.into(),
            workflow_id: workflow_id.into(),
            input,
            options,
        })
    }

    /// Start a typed child workflow and await its result
    pub fn child_workflow<C: Workflow>(
        &self,
        workflow_id: impl Into<String>,
        input: C::Input,
        options: ChildWorkflowOptions,
    ) -> OperationFuture<C::Output> {
        match serde_json::to_value(input) {
            Ok(input) => self.operation(OpRequest::Child {
                workflow_type: C::TYPE.to_string(),
                workflow_id: workflow_id.into(),
                input,
                options,
            }),
            Err(e) => OperationFuture::failed(self.state.clone(), e.into()),
        }
    }

    fn operation<T>(&self, request: OpRequest) -> OperationFuture<T> {
        OperationFuture {
            state: self.state.clone(),
            stage: Stage::NotStarted(request),
            _output: PhantomData,
        }
    }

    // =========================================================================
    // Waiting and cancellation
    // =========================================================================

    /// Resolve once `predicate` holds, re-checked after every applied event
    ///
    /// Fails with a cancellation error if the execution is cancelled while
    /// waiting.
    pub fn wait_condition(
        &self,
        predicate: impl Fn(&W) -> bool + Send + 'static,
    ) -> ConditionFuture<W> {
        ConditionFuture {
            state: self.state.clone(),
            workflow: self.workflow.clone(),
            predicate: Box::new(predicate),
            registered_before_cancel: None,
        }
    }

    /// Resolve with the cancellation error once cancellation is requested
    pub fn cancelled(&self) -> CancelledFuture {
        CancelledFuture {
            state: self.state.clone(),
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.lock().cancel_requested.is_some()
    }

    // =========================================================================
    // Deterministic helpers
    // =========================================================================

    /// Timestamp of the last applied event
    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().now()
    }

    /// Replay-stable UUID
    pub fn uuid(&self) -> Uuid {
        self.state.lock().next_uuid()
    }

    /// Number of events applied so far
    pub fn history_length(&self) -> u64 {
        self.state.lock().history_length()
    }

    // =========================================================================
    // Update handlers and continue-as-new
    // =========================================================================

    pub fn all_handlers_finished(&self) -> bool {
        self.state.lock().running_handlers == 0
    }

    /// Resolve once no update handler is running
    ///
    /// Only meaningful from the entry computation; a handler awaiting this
    /// waits for itself.
    pub fn wait_all_handlers_finished(&self) -> HandlersFinishedFuture {
        HandlersFinishedFuture {
            state: self.state.clone(),
        }
    }

    /// Whether history has grown past the continue-as-new threshold
    pub fn continue_as_new_suggested(&self) -> bool {
        self.state.lock().continuation.is_suggested()
    }

    /// End this run and start a fresh one with `input`
    ///
    /// The returned future never resolves on success. The switch happens once
    /// every running update handler has finished.
    pub fn continue_as_new(&self, input: W::Input) -> ContinueAsNewFuture<W::Output> {
        ContinueAsNewFuture {
            state: self.state.clone(),
            input: Some(serde_json::to_value(input).map_err(WorkflowError::from)),
            _output: PhantomData,
        }
    }
}

enum Stage {
    NotStarted(OpRequest),
    Awaiting(u32),
    Failed(WorkflowError),
    Done,
}

/// Await point for an activity, timer or child workflow
///
/// The operation's command is emitted on first poll, which allocates its
/// sequence id.
pub struct OperationFuture<T> {
    state: Arc<Mutex<ReplayState>>,
    stage: Stage,
    _output: PhantomData<fn() -> T>,
}

impl<T> OperationFuture<T> {
    fn failed(state: Arc<Mutex<ReplayState>>, error: WorkflowError) -> Self {
        Self {
            state,
            stage: Stage::Failed(error),
            _output: PhantomData,
        }
    }

    /// Sequence id, once the operation has been started
    pub fn seq(&self) -> Option<u32> {
        match self.stage {
            Stage::Awaiting(seq) => Some(seq),
            _ => None,
        }
    }
}

impl<T: DeserializeOwned> Future for OperationFuture<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.stage, Stage::Done) {
            Stage::NotStarted(request) => {
                let seq = this.state.lock().start_operation(request);
                this.stage = Stage::Awaiting(seq);
                Poll::Pending
            }
            Stage::Awaiting(seq) => match this.state.lock().take_resolution(seq) {
                Some(result) => Poll::Ready(
                    result.and_then(|value| serde_json::from_value(value).map_err(WorkflowError::from)),
                ),
                None => {
                    this.stage = Stage::Awaiting(seq);
                    Poll::Pending
                }
            },
            Stage::Failed(error) => Poll::Ready(Err(error)),
            Stage::Done => Poll::Pending,
        }
    }
}

/// Await point for [`WorkflowContext::wait_condition`]
pub struct ConditionFuture<W> {
    state: Arc<Mutex<ReplayState>>,
    workflow: Arc<Mutex<W>>,
    predicate: Box<dyn Fn(&W) -> bool + Send>,
    registered_before_cancel: Option<bool>,
}

impl<W> Future for ConditionFuture<W> {
    type Output = Result<(), WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let cancel_reason = this.state.lock().cancel_requested.clone();
        let before_cancel = *this
            .registered_before_cancel
            .get_or_insert(cancel_reason.is_none());

        if let (true, Some(reason)) = (before_cancel, cancel_reason) {
            this.state.lock().bump();
            return Poll::Ready(Err(WorkflowError::cancelled(reason)));
        }

        let satisfied = (this.predicate)(&this.workflow.lock());
        if satisfied {
            this.state.lock().bump();
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

/// Await point for [`WorkflowContext::cancelled`]
pub struct CancelledFuture {
    state: Arc<Mutex<ReplayState>>,
}

impl Future for CancelledFuture {
    type Output = WorkflowError;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        match state.cancel_requested.clone() {
            Some(reason) => {
                state.bump();
                Poll::Ready(WorkflowError::cancelled(reason))
            }
            None => Poll::Pending,
        }
    }
}

/// Await point for [`WorkflowContext::wait_all_handlers_finished`]
pub struct HandlersFinishedFuture {
    state: Arc<Mutex<ReplayState>>,
}

impl Future for HandlersFinishedFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        if state.running_handlers == 0 {
            state.bump();
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Returned by [`WorkflowContext::continue_as_new`]
pub struct ContinueAsNewFuture<T> {
    state: Arc<Mutex<ReplayState>>,
    input: Option<Result<Value, WorkflowError>>,
    _output: PhantomData<fn() -> T>,
}

impl<T> Future for ContinueAsNewFuture<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.input.take() {
            Some(Ok(input)) => {
                let mut state = this.state.lock();
                state.continuation.request(input);
                state.bump();
                Poll::Pending
            }
            Some(Err(error)) => Poll::Ready(Err(error)),
            None => Poll::Pending,
        }
    }
}
