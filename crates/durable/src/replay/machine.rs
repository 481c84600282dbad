//! Replay machine: drives one workflow's futures through its history

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::noop_waker_ref;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use super::context::{WorkflowContext, WorkflowInfo};
use super::state::ReplayState;
use super::{ReplayConfig, ReplayError};
use crate::error::NonDeterminismError;
use crate::persistence::{codec, EventRecord};
use crate::workflow::{Command, HistoryEvent, Workflow, WorkflowError, WorkflowOutcome};

/// Upper bound on polling rounds after one event
const MAX_POLL_ROUNDS: usize = 10_000;

/// Type-erased replay of one execution
///
/// This trait allows the executor to drive workflows without knowing their
/// concrete types. Events go in, commands come out.
pub trait AnyExecution: Send {
    fn workflow_type(&self) -> &'static str;

    /// Apply the next recorded event
    fn apply(&mut self, record: &EventRecord) -> Result<(), ReplayError>;

    /// Commands emitted but not matched by any recorded event
    fn take_commands(&mut self) -> Vec<Command>;

    fn query(&self, name: &str, args: Value) -> Result<Value, WorkflowError>;

    fn validate_update(&self, name: &str, args: &Value) -> Result<(), WorkflowError>;

    /// Whether a terminal command was emitted or a terminal event applied
    fn is_finished(&self) -> bool;

    fn history_length(&self) -> u64;
}

type Coroutine = BoxFuture<'static, Result<Value, WorkflowError>>;

struct Live<W> {
    state: Arc<Mutex<ReplayState>>,
    workflow: Arc<Mutex<W>>,
    main: Option<Coroutine>,
    main_result: Option<Result<Value, WorkflowError>>,
    /// Running update handlers in acceptance order
    handlers: Vec<(String, Coroutine)>,
}

/// Replay of a concrete workflow type
pub struct ReplayMachine<W: Workflow> {
    config: ReplayConfig,
    live: Option<Live<W>>,
    finished: bool,
    history_length: u64,
}

impl<W: Workflow> ReplayMachine<W> {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            live: None,
            finished: false,
            history_length: 0,
        }
    }

    fn start(&mut self, record: &EventRecord, info: WorkflowInfo, input: &Value) -> Result<(), ReplayError> {
        let input: W::Input =
            serde_json::from_value(input.clone()).map_err(|e| ReplayError::InvalidPayload {
                sequence_no: record.sequence_no,
                message: e.to_string(),
            })?;

        let state = Arc::new(Mutex::new(ReplayState::new(
            info,
            self.config.default_activity_options.clone(),
            self.config.continue_as_new_threshold,
        )));
        let workflow = Arc::new(Mutex::new(W::new(&input)));
        let ctx = WorkflowContext::new(state.clone(), workflow.clone());

        let main: Coroutine = Box::pin(async move {
            let output = W::run(ctx, input).await?;
            serde_json::to_value(output).map_err(WorkflowError::from)
        });

        self.live = Some(Live {
            state,
            workflow,
            main: Some(main),
            main_result: None,
            handlers: Vec::new(),
        });
        Ok(())
    }

    fn apply_command_event(&mut self, record: &EventRecord) -> Result<(), ReplayError> {
        let event = &record.event;
        let produced = self
            .live
            .as_ref()
            .and_then(|live| live.state.lock().pop_command());

        match produced {
            Some(command) => codec::verify(record.sequence_no, &command, event)?,
            None => {
                return Err(NonDeterminismError::new(record.sequence_no, event.describe(), "nothing").into())
            }
        }

        if event.is_terminal() {
            self.finish();
        }
        Ok(())
    }

    /// Drop every coroutine; nothing runs after the run closes
    fn finish(&mut self) {
        self.finished = true;
        if let Some(live) = self.live.as_mut() {
            live.main = None;
            live.handlers.clear();
        }
    }

    fn poll_until_quiescent(&mut self) {
        if self.finished {
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };

        let mut terminal = false;
        let mut settled = false;
        for _ in 0..MAX_POLL_ROUNDS {
            let before = live.state.lock().generation();
            live.poll_round();
            if live.emit_terminal_if_ready() {
                terminal = true;
                break;
            }
            if live.state.lock().generation() == before {
                settled = true;
                break;
            }
        }

        if terminal {
            self.finish();
        } else if !settled {
            warn!(
                workflow_type = W::TYPE,
                "workflow did not settle after {} polling rounds", MAX_POLL_ROUNDS
            );
        }
    }
}

impl<W: Workflow> Live<W> {
    /// Poll the entry computation, then handlers in acceptance order
    fn poll_round(&mut self) {
        let mut cx = Context::from_waker(noop_waker_ref());

        if let Some(main) = self.main.as_mut() {
            if let Poll::Ready(result) = main.as_mut().poll(&mut cx) {
                self.main = None;
                self.main_result = Some(result);
                self.state.lock().bump();
            }
        }

        let mut i = 0;
        while i < self.handlers.len() {
            match self.handlers[i].1.as_mut().poll(&mut cx) {
                Poll::Ready(result) => {
                    let (update_id, _) = self.handlers.remove(i);
                    let mut state = self.state.lock();
                    state.running_handlers -= 1;
                    state.push_command(Command::CompleteUpdate {
                        update_id,
                        outcome: result.into(),
                    });
                }
                Poll::Pending => i += 1,
            }
        }
    }

    /// Emit the run's terminal command once nothing may still write to it
    fn emit_terminal_if_ready(&mut self) -> bool {
        let mut state = self.state.lock();
        if state.running_handlers > 0 {
            return false;
        }

        let command = if let Some(input) = state.continuation.take_ready(0) {
            Command::ContinueAsNew { input }
        } else {
            match self.main_result.take() {
                None => return false,
                Some(Ok(result)) => Command::CompleteWorkflow { result },
                Some(Err(error)) => match state.cancel_requested.clone() {
                    Some(reason) if error.is_cancelled() => Command::CancelWorkflow { reason },
                    _ => Command::FailWorkflow { error },
                },
            }
        };
        state.push_command(command);
        true
    }
}

impl<W: Workflow> AnyExecution for ReplayMachine<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn apply(&mut self, record: &EventRecord) -> Result<(), ReplayError> {
        self.history_length = record.sequence_no;
        if let Some(live) = self.live.as_ref() {
            live.state.lock().advance(record.sequence_no, record.timestamp);
        }

        let event = &record.event;
        if event.is_command_event() {
            return self.apply_command_event(record);
        }

        match event {
            HistoryEvent::WorkflowStarted {
                workflow_type,
                input,
                parent,
                continued_from,
            } => {
                let info = WorkflowInfo {
                    workflow_id: self.config.execution.workflow_id.clone(),
                    run_id: self.config.execution.run_id,
                    workflow_type: workflow_type.clone(),
                    parent: parent.clone(),
                    continued_from: *continued_from,
                };
                self.start(record, info, input)?;
                if let Some(live) = self.live.as_ref() {
                    live.state.lock().advance(record.sequence_no, record.timestamp);
                }
            }
            HistoryEvent::WorkflowCompleted {
                outcome: WorkflowOutcome::Terminated { .. },
            } => {
                // Appended from outside; commands of a pass it raced with never landed
                if let Some(live) = self.live.as_ref() {
                    live.state.lock().clear_commands();
                }
                self.finish();
                return Ok(());
            }
            _ => {}
        }

        let Some(live) = self.live.as_mut() else {
            return Err(NonDeterminismError::new(
                record.sequence_no,
                event.describe(),
                "no workflow started",
            )
            .into());
        };

        match event {
            HistoryEvent::WorkflowCancelRequested { reason } => {
                if !self.finished {
                    live.state.lock().cancel_open_operations(reason);
                }
            }
            HistoryEvent::ActivityCompleted { seq, result, .. } => {
                live.state.lock().resolve_activity(*seq, Ok(result));
            }
            HistoryEvent::ActivityFailed { seq, error, .. } => {
                live.state.lock().resolve_activity(*seq, Err(error));
            }
            HistoryEvent::TimerFired { seq } => {
                live.state.lock().resolve_timer(*seq);
            }
            HistoryEvent::ChildWorkflowCompleted { seq, outcome } => {
                live.state.lock().resolve_child(*seq, outcome);
            }
            HistoryEvent::SignalReceived { name, payload } => {
                if !self.finished {
                    live.workflow.lock().on_signal(name, payload.clone());
                    live.state.lock().bump();
                }
            }
            HistoryEvent::UpdateAccepted {
                update_id,
                name,
                args,
            } => {
                if !self.finished {
                    let ctx = WorkflowContext::new(live.state.clone(), live.workflow.clone());
                    let handler = W::handle_update(ctx, name.clone(), args.clone());
                    live.handlers.push((update_id.clone(), handler));
                    live.state.lock().running_handlers += 1;
                }
            }
            _ => {}
        }

        self.poll_until_quiescent();
        Ok(())
    }

    fn take_commands(&mut self) -> Vec<Command> {
        self.live
            .as_ref()
            .map(|live| live.state.lock().drain_commands())
            .unwrap_or_default()
    }

    fn query(&self, name: &str, args: Value) -> Result<Value, WorkflowError> {
        match self.live.as_ref() {
            Some(live) => live.workflow.lock().query(name, args),
            None => Err(WorkflowError::new("workflow has not started").with_code("NOT_STARTED")),
        }
    }

    fn validate_update(&self, name: &str, args: &Value) -> Result<(), WorkflowError> {
        match self.live.as_ref() {
            Some(live) => live.workflow.lock().validate_update(name, args),
            None => Err(WorkflowError::new("workflow has not started").with_code("NOT_STARTED")),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn history_length(&self) -> u64 {
        self.history_length
    }
}
