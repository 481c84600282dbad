//! Open operations derived from a history
//!
//! Used when a run closes (to apply parent-close policies) and on recovery
//! (to re-dispatch work that was in flight when the process stopped).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use crate::persistence::{EventRecord, ExecutionId};
use crate::workflow::{ActivityOptions, HistoryEvent, ParentClosePolicy};

/// A scheduled activity with no result and no cancel request
#[derive(Debug, Clone, PartialEq)]
pub struct OpenActivity {
    pub seq: u32,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
}

/// A started child with no recorded completion
#[derive(Debug, Clone, PartialEq)]
pub struct OpenChild {
    pub seq: u32,
    pub execution: ExecutionId,
    pub workflow_type: String,
    pub input: Value,
    pub parent_close_policy: ParentClosePolicy,
}

/// Work still open at the end of a history
#[derive(Debug, Default)]
pub struct PendingWork {
    pub activities: Vec<OpenActivity>,
    /// `(seq, fire_at)` of timers that neither fired nor were cancelled
    pub timers: Vec<(u32, DateTime<Utc>)>,
    pub children: Vec<OpenChild>,
    /// Terminal record, if the history is closed
    pub terminal: Option<EventRecord>,
}

impl PendingWork {
    pub fn from_history(records: &[EventRecord]) -> Self {
        let mut activities = BTreeMap::new();
        let mut timers = BTreeMap::new();
        let mut children = BTreeMap::new();
        let mut terminal = None;

        for record in records {
            match &record.event {
                HistoryEvent::ActivityScheduled {
                    seq,
                    activity_type,
                    input,
                    options,
                } => {
                    activities.insert(
                        *seq,
                        OpenActivity {
                            seq: *seq,
                            activity_type: activity_type.clone(),
                            input: input.clone(),
                            options: options.clone(),
                        },
                    );
                }
                HistoryEvent::ActivityCompleted { seq, .. }
                | HistoryEvent::ActivityFailed { seq, .. }
                | HistoryEvent::ActivityCancelRequested { seq } => {
                    activities.remove(seq);
                }
                HistoryEvent::TimerStarted { seq, fire_at, .. } => {
                    timers.insert(*seq, *fire_at);
                }
                HistoryEvent::TimerFired { seq } | HistoryEvent::TimerCancelled { seq } => {
                    timers.remove(seq);
                }
                HistoryEvent::ChildWorkflowStarted {
                    seq,
                    workflow_id,
                    run_id,
                    workflow_type,
                    input,
                    options,
                } => {
                    children.insert(
                        *seq,
                        OpenChild {
                            seq: *seq,
                            execution: ExecutionId::new(workflow_id.clone(), *run_id),
                            workflow_type: workflow_type.clone(),
                            input: input.clone(),
                            parent_close_policy: options.parent_close_policy,
                        },
                    );
                }
                HistoryEvent::ChildWorkflowCompleted { seq, .. } => {
                    children.remove(seq);
                }
                event if event.is_terminal() => terminal = Some(record.clone()),
                _ => {}
            }
        }

        Self {
            activities: activities.into_values().collect(),
            timers: timers.into_iter().collect(),
            children: children.into_values().collect(),
            terminal,
        }
    }

    /// Child started at `seq`, whether or not it is still open
    pub fn find_child(records: &[EventRecord], seq: u32) -> Option<ExecutionId> {
        records.iter().find_map(|record| match &record.event {
            HistoryEvent::ChildWorkflowStarted {
                seq: started,
                workflow_id,
                run_id,
                ..
            } if *started == seq => Some(ExecutionId::new(workflow_id.clone(), *run_id)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ChildWorkflowOptions, WorkflowOutcome};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn records(events: Vec<HistoryEvent>) -> Vec<EventRecord> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| EventRecord {
                sequence_no: i as u64 + 1,
                event_id: format!("e-{i}"),
                timestamp: Utc::now(),
                event,
            })
            .collect()
    }

    fn scheduled(seq: u32) -> HistoryEvent {
        HistoryEvent::ActivityScheduled {
            seq,
            activity_type: "work".to_string(),
            input: json!(seq),
            options: ActivityOptions::default(),
        }
    }

    #[test]
    fn test_open_activities_and_timers() {
        let fire_at = Utc::now();
        let history = records(vec![
            scheduled(1),
            scheduled(2),
            scheduled(3),
            HistoryEvent::ActivityCompleted {
                seq: 1,
                result: json!(null),
                attempts: 1,
            },
            HistoryEvent::ActivityCancelRequested { seq: 3 },
            HistoryEvent::TimerStarted {
                seq: 4,
                duration: Duration::from_secs(1),
                fire_at,
            },
            HistoryEvent::TimerStarted {
                seq: 5,
                duration: Duration::from_secs(1),
                fire_at,
            },
            HistoryEvent::TimerFired { seq: 5 },
        ]);

        let pending = PendingWork::from_history(&history);
        let open: Vec<u32> = pending.activities.iter().map(|a| a.seq).collect();
        assert_eq!(open, vec![2]);
        assert_eq!(pending.timers, vec![(4, fire_at)]);
        assert!(pending.terminal.is_none());
    }

    #[test]
    fn test_open_children_and_terminal() {
        let run_id = Uuid::now_v7();
        let child = |seq: u32, policy| HistoryEvent::ChildWorkflowStarted {
            seq,
            workflow_id: format!("child-{seq}"),
            run_id,
            workflow_type: "child".to_string(),
            input: json!(null),
            options: ChildWorkflowOptions::default().with_parent_close_policy(policy),
        };
        let history = records(vec![
            child(1, ParentClosePolicy::Terminate),
            child(2, ParentClosePolicy::Abandon),
            HistoryEvent::ChildWorkflowCompleted {
                seq: 1,
                outcome: WorkflowOutcome::Succeeded { result: json!(1) },
            },
            HistoryEvent::WorkflowCompleted {
                outcome: WorkflowOutcome::Succeeded { result: json!(2) },
            },
        ]);

        let pending = PendingWork::from_history(&history);
        assert_eq!(pending.children.len(), 1);
        assert_eq!(pending.children[0].execution.workflow_id, "child-2");
        assert_eq!(pending.children[0].parent_close_policy, ParentClosePolicy::Abandon);
        assert_eq!(pending.terminal.map(|r| r.sequence_no), Some(4));

        let found = PendingWork::find_child(&history, 1).unwrap();
        assert_eq!(found.workflow_id, "child-1");
    }
}
