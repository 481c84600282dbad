//! Durable timer scheduling
//!
//! Timers live in history (`TimerStarted.fire_at`); this service only holds
//! the in-memory deadlines of open timers and emits `TimerFired` once they
//! pass. On restart the executor re-registers them from history.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::OrchestratorEvent;
use crate::persistence::ExecutionId;

/// Longest the service sleeps with nothing scheduled
const IDLE_WAIT: Duration = Duration::from_secs(3600);

type Deadline = (DateTime<Utc>, u64);

/// Ordered set of pending deadlines
///
/// Timers with the same `fire_at` fire in registration order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<Deadline, (ExecutionId, u32)>,
    index: HashMap<(ExecutionId, u32), Deadline>,
    next_registration: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timer; returns false if it is already registered
    pub fn schedule(&mut self, execution: ExecutionId, seq: u32, fire_at: DateTime<Utc>) -> bool {
        let key = (execution, seq);
        if self.index.contains_key(&key) {
            return false;
        }
        let deadline = (fire_at, self.next_registration);
        self.next_registration += 1;
        self.entries.insert(deadline, key.clone());
        self.index.insert(key, deadline);
        true
    }

    pub fn cancel(&mut self, execution: &ExecutionId, seq: u32) -> bool {
        match self.index.remove(&(execution.clone(), seq)) {
            Some(deadline) => {
                self.entries.remove(&deadline);
                true
            }
            None => false,
        }
    }

    /// Drop every timer of `execution`, returning how many were removed
    pub fn cancel_all(&mut self, execution: &ExecutionId) -> usize {
        let keys: Vec<_> = self
            .index
            .keys()
            .filter(|(id, _)| id == execution)
            .cloned()
            .collect();
        for (id, seq) in &keys {
            self.cancel(id, *seq);
        }
        keys.len()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(ExecutionId, u32)> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.index.remove(&key);
            due.push(key);
        }
        due
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().map(|(fire_at, _)| *fire_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Background task firing timers from a [`TimerQueue`]
#[derive(Clone)]
pub struct TimerService {
    queue: Arc<Mutex<TimerQueue>>,
    wake: Arc<Notify>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl TimerService {
    pub fn new(events: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(TimerQueue::new())),
            wake: Arc::new(Notify::new()),
            events,
        }
    }

    pub fn schedule(&self, execution: ExecutionId, seq: u32, fire_at: DateTime<Utc>) {
        if self.queue.lock().schedule(execution, seq, fire_at) {
            self.wake.notify_one();
        }
    }

    pub fn cancel(&self, execution: &ExecutionId, seq: u32) {
        self.queue.lock().cancel(execution, seq);
    }

    pub fn cancel_all(&self, execution: &ExecutionId) {
        let removed = self.queue.lock().cancel_all(execution);
        if removed > 0 {
            debug!(execution = %execution, removed, "dropped open timers");
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Fire timers until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let (due, next) = {
                let mut queue = self.queue.lock();
                let due = queue.pop_due(Utc::now());
                (due, queue.next_deadline())
            };

            for (execution, seq) in due {
                trace!(execution = %execution, seq, "timer fired");
                if self
                    .events
                    .send(OrchestratorEvent::TimerFired { execution, seq })
                    .is_err()
                {
                    return;
                }
            }

            let wait = next
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAIT);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("timer service stopped");
                    return;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
