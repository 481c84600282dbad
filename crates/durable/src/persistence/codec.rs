//! Command/event codec
//!
//! Converts commands into the events that record them, and checks re-emitted
//! commands against recorded events during replay. Event ids are derived from
//! the command so a retried append of the same pass is detected as a
//! duplicate by the store.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::NewEvent;
use crate::error::NonDeterminismError;
use crate::workflow::{Command, HistoryEvent, WorkflowOutcome};

/// De-duplication keys for history events
pub mod event_ids {
    pub const WORKFLOW_STARTED: &str = "workflow-started";
    pub const CANCEL_REQUESTED: &str = "cancel-requested";
    /// Shared by every terminal event, so a run closes at most once
    pub const WORKFLOW_CLOSED: &str = "workflow-closed";

    pub fn activity_scheduled(seq: u32) -> String {
        format!("activity-scheduled-{seq}")
    }

    /// Shared by completion and failure: one result per activity
    pub fn activity_result(seq: u32) -> String {
        format!("activity-result-{seq}")
    }

    pub fn activity_cancel(seq: u32) -> String {
        format!("activity-cancel-{seq}")
    }

    pub fn timer_started(seq: u32) -> String {
        format!("timer-started-{seq}")
    }

    pub fn timer_fired(seq: u32) -> String {
        format!("timer-fired-{seq}")
    }

    pub fn timer_cancel(seq: u32) -> String {
        format!("timer-cancel-{seq}")
    }

    pub fn child_started(seq: u32) -> String {
        format!("child-started-{seq}")
    }

    pub fn child_result(seq: u32) -> String {
        format!("child-result-{seq}")
    }

    pub fn child_cancel(seq: u32) -> String {
        format!("child-cancel-{seq}")
    }

    pub fn update_accepted(update_id: &str) -> String {
        format!("update-accepted-{update_id}")
    }

    pub fn update_completed(update_id: &str) -> String {
        format!("update-completed-{update_id}")
    }

    pub fn signal(request_id: &str) -> String {
        format!("signal-{request_id}")
    }
}

/// Convert an accepted command into the event recording it
///
/// `now` fixes timer deadlines. Run ids for children and successors are
/// allocated here, so they are part of history from then on.
pub fn encode(command: Command, now: DateTime<Utc>) -> NewEvent {
    match command {
        Command::ScheduleActivity {
            seq,
            activity_type,
            input,
            options,
        } => NewEvent::new(
            event_ids::activity_scheduled(seq),
            HistoryEvent::ActivityScheduled {
                seq,
                activity_type,
                input,
                options,
            },
        ),
        Command::RequestCancelActivity { seq } => NewEvent::new(
            event_ids::activity_cancel(seq),
            HistoryEvent::ActivityCancelRequested { seq },
        ),
        Command::StartTimer { seq, duration } => {
            let offset = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
            let fire_at = now.checked_add_signed(offset).unwrap_or(DateTime::<Utc>::MAX_UTC);
            NewEvent::new(
                event_ids::timer_started(seq),
                HistoryEvent::TimerStarted {
                    seq,
                    duration,
                    fire_at,
                },
            )
        }
        Command::CancelTimer { seq } => NewEvent::new(
            event_ids::timer_cancel(seq),
            HistoryEvent::TimerCancelled { seq },
        ),
        Command::StartChildWorkflow {
            seq,
            workflow_id,
            workflow_type,
            input,
            options,
        } => NewEvent::new(
            event_ids::child_started(seq),
            HistoryEvent::ChildWorkflowStarted {
                seq,
                workflow_id,
                run_id: Uuid::now_v7(),
                workflow_type,
                input,
                options,
            },
        ),
        Command::RequestCancelChildWorkflow { seq } => NewEvent::new(
            event_ids::child_cancel(seq),
            HistoryEvent::ChildWorkflowCancelRequested { seq },
        ),
        Command::CompleteUpdate { update_id, outcome } => NewEvent::new(
            event_ids::update_completed(&update_id),
            HistoryEvent::UpdateCompleted { update_id, outcome },
        ),
        Command::CompleteWorkflow { result } => closed(WorkflowOutcome::Succeeded { result }),
        Command::FailWorkflow { error } => closed(WorkflowOutcome::Failed { error }),
        Command::CancelWorkflow { reason } => closed(WorkflowOutcome::Cancelled { reason }),
        Command::ContinueAsNew { input } => NewEvent::new(
            event_ids::WORKFLOW_CLOSED,
            HistoryEvent::WorkflowContinuedAsNew {
                new_run_id: Uuid::now_v7(),
                input,
            },
        ),
    }
}

fn closed(outcome: WorkflowOutcome) -> NewEvent {
    NewEvent::new(
        event_ids::WORKFLOW_CLOSED,
        HistoryEvent::WorkflowCompleted { outcome },
    )
}

/// Check that a re-emitted command matches the recorded event
///
/// Structural identity only: kind, sequence id, activity/workflow type,
/// child workflow id, update id and terminal outcome kind. Payloads are
/// not compared.
pub fn verify(
    sequence_no: u64,
    command: &Command,
    event: &HistoryEvent,
) -> Result<(), NonDeterminismError> {
    let matches = match (command, event) {
        (
            Command::ScheduleActivity {
                seq, activity_type, ..
            },
            HistoryEvent::ActivityScheduled {
                seq: recorded_seq,
                activity_type: recorded_type,
                ..
            },
        ) => seq == recorded_seq && activity_type == recorded_type,
        (
            Command::RequestCancelActivity { seq },
            HistoryEvent::ActivityCancelRequested { seq: recorded },
        )
        | (Command::StartTimer { seq, .. }, HistoryEvent::TimerStarted { seq: recorded, .. })
        | (Command::CancelTimer { seq }, HistoryEvent::TimerCancelled { seq: recorded })
        | (
            Command::RequestCancelChildWorkflow { seq },
            HistoryEvent::ChildWorkflowCancelRequested { seq: recorded },
        ) => seq == recorded,
        (
            Command::StartChildWorkflow {
                seq,
                workflow_id,
                workflow_type,
                ..
            },
            HistoryEvent::ChildWorkflowStarted {
                seq: recorded_seq,
                workflow_id: recorded_id,
                workflow_type: recorded_type,
                ..
            },
        ) => seq == recorded_seq && workflow_id == recorded_id && workflow_type == recorded_type,
        (
            Command::CompleteUpdate { update_id, .. },
            HistoryEvent::UpdateCompleted {
                update_id: recorded,
                ..
            },
        ) => update_id == recorded,
        (Command::CompleteWorkflow { .. }, HistoryEvent::WorkflowCompleted { outcome }) => {
            matches!(outcome, WorkflowOutcome::Succeeded { .. })
        }
        (Command::FailWorkflow { .. }, HistoryEvent::WorkflowCompleted { outcome }) => {
            matches!(outcome, WorkflowOutcome::Failed { .. })
        }
        (Command::CancelWorkflow { .. }, HistoryEvent::WorkflowCompleted { outcome }) => {
            matches!(outcome, WorkflowOutcome::Cancelled { .. })
        }
        (Command::ContinueAsNew { .. }, HistoryEvent::WorkflowContinuedAsNew { .. }) => true,
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(NonDeterminismError::new(
            sequence_no,
            event.describe(),
            command.describe(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ActivityOptions, WorkflowError};
    use serde_json::json;
    use std::time::Duration;

    fn schedule(seq: u32, activity_type: &str) -> Command {
        Command::ScheduleActivity {
            seq,
            activity_type: activity_type.to_string(),
            input: json!(null),
            options: ActivityOptions::default(),
        }
    }

    #[test]
    fn test_encode_then_verify_matches() {
        let now = Utc::now();
        let commands = vec![
            schedule(1, "say_hello"),
            Command::StartTimer {
                seq: 2,
                duration: Duration::from_secs(5),
            },
            Command::CompleteUpdate {
                update_id: "u-1".to_string(),
                outcome: Ok(json!(1)).into(),
            },
            Command::FailWorkflow {
                error: WorkflowError::new("boom"),
            },
        ];

        for (i, command) in commands.into_iter().enumerate() {
            let new = encode(command.clone(), now);
            verify(i as u64 + 1, &command, &new.event).unwrap();
        }
    }

    #[test]
    fn test_timer_fire_at() {
        let now = Utc::now();
        let new = encode(
            Command::StartTimer {
                seq: 7,
                duration: Duration::from_millis(1500),
            },
            now,
        );
        assert_eq!(new.event_id, "timer-started-7");
        match new.event {
            HistoryEvent::TimerStarted { fire_at, .. } => {
                assert_eq!(fire_at - now, chrono::Duration::milliseconds(1500));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_terminal_commands_share_event_id() {
        let now = Utc::now();
        let complete = encode(Command::CompleteWorkflow { result: json!(1) }, now);
        let continued = encode(Command::ContinueAsNew { input: json!({}) }, now);
        assert_eq!(complete.event_id, continued.event_id);
    }

    #[test]
    fn test_different_activity_type_is_non_deterministic() {
        let recorded = encode(schedule(1, "charge_card"), Utc::now()).event;
        let err = verify(5, &schedule(1, "refund_card"), &recorded).unwrap_err();
        assert_eq!(err.sequence_no, 5);
        assert!(err.recorded.contains("charge_card"));
        assert!(err.produced.contains("refund_card"));
    }

    #[test]
    fn test_different_kind_is_non_deterministic() {
        let recorded = encode(schedule(1, "charge_card"), Utc::now()).event;
        let timer = Command::StartTimer {
            seq: 1,
            duration: Duration::from_secs(1),
        };
        assert!(verify(2, &timer, &recorded).is_err());
    }

    #[test]
    fn test_outcome_kind_must_match() {
        let recorded = encode(Command::CompleteWorkflow { result: json!(1) }, Utc::now()).event;
        let fail = Command::FailWorkflow {
            error: WorkflowError::new("x"),
        };
        assert!(verify(9, &fail, &recorded).is_err());
    }
}
