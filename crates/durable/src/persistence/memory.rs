//! In-memory implementation of HistoryStore

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use super::store::*;
use crate::workflow::WorkflowError;

struct ExecutionState {
    info: ExecutionInfo,
    events: Vec<EventRecord>,
    event_ids: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    executions: HashMap<ExecutionId, ExecutionState>,
    current_runs: HashMap<String, ExecutionId>,
}

/// In-memory implementation of HistoryStore
///
/// Same semantics as the PostgreSQL store, without durability across
/// process restarts. Used by tests and single-process embedding.
///
/// # Example
///
/// ```
/// use ledgerflow_durable::InMemoryHistoryStore;
///
/// let store = InMemoryHistoryStore::new();
/// assert_eq!(store.execution_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs stored
    pub fn execution_count(&self) -> usize {
        self.inner.read().executions.len()
    }

    /// Total number of history events across all runs
    pub fn event_count(&self) -> usize {
        self.inner
            .read()
            .executions
            .values()
            .map(|e| e.events.len())
            .sum()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        if let Some(current) = inner.current_runs.get(&execution.id.workflow_id) {
            let open = inner
                .executions
                .get(current)
                .map(|e| !e.info.status.is_closed())
                .unwrap_or(false);
            if open {
                return Err(StoreError::WorkflowAlreadyRunning(
                    execution.id.workflow_id.clone(),
                ));
            }
        }

        let now = Utc::now();
        let started = execution.started_event();
        let info = ExecutionInfo {
            id: execution.id.clone(),
            workflow_type: execution.workflow_type,
            status: ExecutionStatus::Running,
            input: execution.input,
            parent: execution.parent,
            result: None,
            error: None,
            created_at: now,
            closed_at: None,
        };
        inner
            .current_runs
            .insert(execution.id.workflow_id.clone(), execution.id.clone());
        inner.executions.insert(
            execution.id,
            ExecutionState {
                info,
                event_ids: HashSet::from([started.event_id.clone()]),
                events: vec![EventRecord {
                    sequence_no: 1,
                    event_id: started.event_id,
                    timestamp: now,
                    event: started.event,
                }],
            },
        );
        Ok(())
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionInfo, StoreError> {
        self.inner
            .read()
            .executions
            .get(id)
            .map(|e| e.info.clone())
            .ok_or_else(|| StoreError::ExecutionNotFound(id.clone()))
    }

    async fn current_run(&self, workflow_id: &str) -> Result<ExecutionId, StoreError> {
        self.inner
            .read()
            .current_runs
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let state = inner
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.clone()))?;

        state.info.status = status;
        state.info.result = result;
        state.info.error = error;
        if status.is_closed() {
            state.info.closed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_executions(&self, status: ExecutionStatus) -> Result<Vec<ExecutionId>, StoreError> {
        let inner = self.inner.read();
        let mut ids: Vec<ExecutionId> = inner
            .executions
            .values()
            .filter(|e| e.info.status == status)
            .map(|e| e.info.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn append_events(
        &self,
        id: &ExecutionId,
        expected_sequence: Option<u64>,
        events: Vec<NewEvent>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let state = inner
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.clone()))?;

        for new in &events {
            if state.event_ids.contains(&new.event_id) {
                let sequence_no = state
                    .events
                    .iter()
                    .find(|r| r.event_id == new.event_id)
                    .map(|r| r.sequence_no)
                    .unwrap_or_default();
                return Err(StoreError::DuplicateEvent {
                    event_id: new.event_id.clone(),
                    sequence_no,
                });
            }
        }

        if state.info.status.is_closed() {
            return Err(StoreError::ExecutionClosed(id.clone()));
        }

        let next = state.events.len() as u64 + 1;
        if let Some(expected) = expected_sequence {
            if expected != next {
                return Err(StoreError::ConcurrencyConflict {
                    expected,
                    actual: next,
                });
            }
        }

        let now = Utc::now();
        let mut sequence_no = next - 1;
        for new in events {
            sequence_no += 1;
            if let Some((status, result, error)) = new.event.closing_status() {
                state.info.status = status;
                state.info.result = result;
                state.info.error = error;
                state.info.closed_at = Some(now);
            }
            state.event_ids.insert(new.event_id.clone());
            state.events.push(EventRecord {
                sequence_no,
                event_id: new.event_id,
                timestamp: now,
                event: new.event,
            });
        }
        Ok(sequence_no)
    }

    async fn read(&self, id: &ExecutionId, from_seq: u64) -> Result<Vec<EventRecord>, StoreError> {
        let inner = self.inner.read();
        let state = inner
            .executions
            .get(id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.clone()))?;
        Ok(state
            .events
            .iter()
            .filter(|r| r.sequence_no >= from_seq)
            .cloned()
            .collect())
    }
}
