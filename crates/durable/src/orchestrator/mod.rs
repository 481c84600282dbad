//! Task orchestrator
//!
//! Turns committed command events into external work and reports the
//! outcomes back as [`OrchestratorEvent`]s:
//!
//! ```text
//! ┌──────────────┐ ActivityScheduled ┌────────────────────┐
//! │   executor   │──────────────────▶│ ActivityDispatcher │──┐
//! │ (after pass) │ TimerStarted      ├────────────────────┤  │ OrchestratorEvent
//! │              │──────────────────▶│    TimerService    │──┤ (mpsc)
//! └──────▲───────┘                   └────────────────────┘  │
//!        │        append result + trigger pass               │
//!        └──────────────── completion loop ◀─────────────────┘
//! ```
//!
//! A single completion loop consumes the channel, so the order in which
//! outcomes reach history is the order they arrive on the channel.

mod activity;
mod pending;
mod timer;

pub use activity::ActivityDispatcher;
pub use pending::{OpenActivity, OpenChild, PendingWork};
pub use timer::{TimerQueue, TimerService};

use serde_json::Value;

use crate::activity::ActivityError;
use crate::persistence::codec::event_ids;
use crate::persistence::{ExecutionId, NewEvent};
use crate::workflow::HistoryEvent;

/// Outcome produced outside the replay engine
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// An activity finished: success, or failure after retries
    ActivityResolved {
        execution: ExecutionId,
        seq: u32,
        outcome: Result<Value, ActivityError>,
        attempts: u32,
    },
    TimerFired {
        execution: ExecutionId,
        seq: u32,
    },
}

impl OrchestratorEvent {
    pub fn execution(&self) -> &ExecutionId {
        match self {
            Self::ActivityResolved { execution, .. } | Self::TimerFired { execution, .. } => execution,
        }
    }

    /// The history event recording this outcome
    pub fn into_new_event(self) -> (ExecutionId, NewEvent) {
        match self {
            Self::ActivityResolved {
                execution,
                seq,
                outcome,
                attempts,
            } => {
                let event = match outcome {
                    Ok(result) => HistoryEvent::ActivityCompleted {
                        seq,
                        result,
                        attempts,
                    },
                    Err(error) => HistoryEvent::ActivityFailed {
                        seq,
                        error,
                        attempts,
                    },
                };
                (execution, NewEvent::new(event_ids::activity_result(seq), event))
            }
            Self::TimerFired { execution, seq } => (
                execution,
                NewEvent::new(event_ids::timer_fired(seq), HistoryEvent::TimerFired { seq }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_activity_outcome_event() {
        let execution = ExecutionId::new("wf-1", Uuid::now_v7());
        let (id, new) = OrchestratorEvent::ActivityResolved {
            execution: execution.clone(),
            seq: 3,
            outcome: Err(ActivityError::non_retryable("boom")),
            attempts: 2,
        }
        .into_new_event();

        assert_eq!(id, execution);
        assert_eq!(new.event_id, event_ids::activity_result(3));
        assert!(matches!(
            new.event,
            HistoryEvent::ActivityFailed { seq: 3, attempts: 2, .. }
        ));

        let (_, new) = OrchestratorEvent::ActivityResolved {
            execution,
            seq: 4,
            outcome: Ok(json!("ok")),
            attempts: 1,
        }
        .into_new_event();
        assert_eq!(new.event.kind(), "activity_completed");
    }

    #[test]
    fn test_timer_fired_event() {
        let execution = ExecutionId::new("wf-1", Uuid::now_v7());
        let (_, new) = OrchestratorEvent::TimerFired { execution, seq: 2 }.into_new_event();
        assert_eq!(new.event_id, event_ids::timer_fired(2));
        assert_eq!(new.event, HistoryEvent::TimerFired { seq: 2 });
    }
}
