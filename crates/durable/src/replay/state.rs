//! Bookkeeping shared by the replay machine and the futures workflow code awaits

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::continuation::ContinuationManager;
use super::context::WorkflowInfo;
use crate::activity::ActivityError;
use crate::workflow::{
    ActivityOptions, ChildWorkflowOptions, Command, WorkflowError, WorkflowOutcome,
};

/// Operation requested by workflow code, not yet assigned a sequence id
#[derive(Debug)]
pub(crate) enum OpRequest {
    Activity {
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    },
    Timer {
        duration: Duration,
    },
    Child {
        workflow_type: String,
        workflow_id: String,
        input: Value,
        options: ChildWorkflowOptions,
    },
}

impl OpRequest {
    fn into_command(self, seq: u32) -> (OpKind, Command) {
        match self {
            Self::Activity {
                activity_type,
                input,
                options,
            } => (
                OpKind::Activity {
                    activity_type: activity_type.clone(),
                },
                Command::ScheduleActivity {
                    seq,
                    activity_type,
                    input,
                    options,
                },
            ),
            Self::Timer { duration } => (OpKind::Timer, Command::StartTimer { seq, duration }),
            Self::Child {
                workflow_type,
                workflow_id,
                input,
                options,
            } => (
                OpKind::Child {
                    workflow_type: workflow_type.clone(),
                    workflow_id: workflow_id.clone(),
                },
                Command::StartChildWorkflow {
                    seq,
                    workflow_id,
                    workflow_type,
                    input,
                    options,
                },
            ),
        }
    }
}

#[derive(Debug, Clone)]
enum OpKind {
    Activity { activity_type: String },
    Timer,
    Child {
        workflow_type: String,
        workflow_id: String,
    },
}

#[derive(Debug)]
enum OpStatus {
    Awaiting,
    Resumed(Result<Value, WorkflowError>),
}

#[derive(Debug)]
struct PendingOp {
    kind: OpKind,
    status: OpStatus,
}

/// State of one replay, shared through `Arc<Mutex<_>>`
///
/// Never held while workflow code runs; futures lock it briefly on poll.
#[derive(Debug)]
pub(crate) struct ReplayState {
    pub(crate) info: WorkflowInfo,
    pub(crate) default_activity_options: ActivityOptions,
    pub(crate) continuation: ContinuationManager,
    /// Reason of an applied cancellation request
    pub(crate) cancel_requested: Option<String>,
    pub(crate) running_handlers: usize,
    now: DateTime<Utc>,
    history_length: u64,
    next_seq: u32,
    uuid_counter: u64,
    ops: BTreeMap<u32, PendingOp>,
    commands: VecDeque<Command>,
    /// Bumped on every observable change; the machine polls until it settles
    generation: u64,
}

impl ReplayState {
    pub(crate) fn new(
        info: WorkflowInfo,
        default_activity_options: ActivityOptions,
        continue_as_new_threshold: u64,
    ) -> Self {
        Self {
            info,
            default_activity_options,
            continuation: ContinuationManager::new(continue_as_new_threshold),
            cancel_requested: None,
            running_handlers: 0,
            now: DateTime::<Utc>::UNIX_EPOCH,
            history_length: 0,
            next_seq: 1,
            uuid_counter: 0,
            ops: BTreeMap::new(),
            commands: VecDeque::new(),
            generation: 0,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn history_length(&self) -> u64 {
        self.history_length
    }

    /// Move the deterministic clock to an applied event
    pub(crate) fn advance(&mut self, sequence_no: u64, timestamp: DateTime<Utc>) {
        self.history_length = sequence_no;
        self.now = timestamp;
        self.continuation.observe_history_length(sequence_no);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn bump(&mut self) {
        self.generation += 1;
    }

    pub(crate) fn next_uuid(&mut self) -> Uuid {
        self.uuid_counter += 1;
        Uuid::new_v5(&self.info.run_id, &self.uuid_counter.to_be_bytes())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    pub(crate) fn push_command(&mut self, command: Command) {
        self.commands.push_back(command);
        self.bump();
    }

    pub(crate) fn pop_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub(crate) fn drain_commands(&mut self) -> Vec<Command> {
        self.commands.drain(..).collect()
    }

    pub(crate) fn clear_commands(&mut self) {
        self.commands.clear();
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Allocate the next sequence id and emit the operation's command
    pub(crate) fn start_operation(&mut self, request: OpRequest) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (kind, command) = request.into_command(seq);
        self.ops.insert(
            seq,
            PendingOp {
                kind,
                status: OpStatus::Awaiting,
            },
        );
        self.push_command(command);
        seq
    }

    /// Hand a resolved result to the awaiting future, removing the operation
    pub(crate) fn take_resolution(&mut self, seq: u32) -> Option<Result<Value, WorkflowError>> {
        if !matches!(self.ops.get(&seq)?.status, OpStatus::Resumed(_)) {
            return None;
        }
        let op = self.ops.remove(&seq)?;
        self.bump();
        match op.status {
            OpStatus::Resumed(result) => Some(result),
            OpStatus::Awaiting => None,
        }
    }

    /// Resolve an awaiting operation; late or unknown completions are ignored
    fn resolve(&mut self, seq: u32, result: impl FnOnce(&OpKind) -> Result<Value, WorkflowError>) {
        if let Some(op) = self.ops.get_mut(&seq) {
            if matches!(op.status, OpStatus::Awaiting) {
                op.status = OpStatus::Resumed(result(&op.kind));
                self.bump();
            }
        }
    }

    pub(crate) fn resolve_activity(&mut self, seq: u32, result: Result<&Value, &ActivityError>) {
        self.resolve(seq, |kind| match result {
            Ok(value) => Ok(value.clone()),
            Err(error) => {
                let activity_type = match kind {
                    OpKind::Activity { activity_type } => activity_type.as_str(),
                    _ => "unknown",
                };
                Err(WorkflowError::activity_failed(activity_type, seq, error))
            }
        });
    }

    pub(crate) fn resolve_timer(&mut self, seq: u32) {
        self.resolve(seq, |_| Ok(Value::Null));
    }

    pub(crate) fn resolve_child(&mut self, seq: u32, outcome: &WorkflowOutcome) {
        self.resolve(seq, |kind| {
            let (workflow_type, workflow_id) = match kind {
                OpKind::Child {
                    workflow_type,
                    workflow_id,
                } => (workflow_type.as_str(), workflow_id.as_str()),
                _ => ("unknown", "unknown"),
            };
            outcome
                .clone()
                .into_result()
                .map_err(|error| WorkflowError::child_failed(workflow_type, workflow_id, error))
        });
    }

    /// Apply a cancellation request
    ///
    /// Every awaiting operation resumes with a cancellation error and gets a
    /// cancel command, in sequence order.
    pub(crate) fn cancel_open_operations(&mut self, reason: &str) {
        self.cancel_requested = Some(reason.to_string());
        let mut cancels = Vec::new();
        for (&seq, op) in self.ops.iter_mut() {
            if !matches!(op.status, OpStatus::Awaiting) {
                continue;
            }
            op.status = OpStatus::Resumed(Err(WorkflowError::cancelled(reason)));
            cancels.push(match op.kind {
                OpKind::Activity { .. } => Command::RequestCancelActivity { seq },
                OpKind::Timer => Command::CancelTimer { seq },
                OpKind::Child { .. } => Command::RequestCancelChildWorkflow { seq },
            });
        }
        for command in cancels {
            self.push_command(command);
        }
        self.bump();
    }
}
