//! Per-execution mutual exclusion
//!
//! At most one evaluation pass runs for a given (workflow_id, run_id) at any
//! time. Passes for different executions never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::persistence::ExecutionId;

#[derive(Debug, Default)]
pub struct ExecutionLocks {
    locks: DashMap<ExecutionId, Arc<Mutex<()>>>,
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`
    pub async fn acquire(&self, id: &ExecutionId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget the lock of a closed execution if nobody holds or waits on it
    pub fn release(&self, id: &ExecutionId) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
