//! Resuming executions after a restart
//!
//! Activity invocations and timer deadlines live in memory only. After a
//! restart they are rebuilt from history; everything else is derived by the
//! next evaluation pass.
//!
//! A run is closed in the same store write that records its terminal event,
//! so the side effects of closing can be lost to a crash. Recovery redoes
//! them: continue-as-new successors are created, outcomes of closed children
//! are delivered to their parents, and parent-close policies are applied to
//! children of closed parents.

use tracing::{debug, error, info, instrument};

use super::executor::{ExecutorError, WorkflowExecutor};
use crate::orchestrator::{OpenChild, PendingWork};
use crate::persistence::{ExecutionId, ExecutionStatus, HistoryStore, StoreError};
use crate::workflow::{HistoryEvent, ParentRef};

impl<S: HistoryStore> WorkflowExecutor<S> {
    /// Resume every running execution found in the store
    ///
    /// Returns the number of executions resumed. Attempt counts of
    /// re-dispatched activities start again at 1.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, ExecutorError> {
        let continued = self
            .inner
            .store
            .list_executions(ExecutionStatus::ContinuedAsNew)
            .await?;
        for id in &continued {
            if let Err(err) = self.recover_successor(id).await {
                error!(execution = %id, error = %err, "failed to create continue-as-new successor");
            }
        }

        let running = self
            .inner
            .store
            .list_executions(ExecutionStatus::Running)
            .await?;

        let mut recovered = 0;
        for id in &running {
            match self.recover_execution(id).await {
                Ok(()) => recovered += 1,
                Err(err) => error!(execution = %id, error = %err, "failed to recover execution"),
            }
        }
        info!(recovered, found = running.len(), "recovered running executions");
        Ok(recovered)
    }

    async fn recover_successor(&self, id: &ExecutionId) -> Result<(), ExecutorError> {
        // a later run exists, so the successor was created
        if self.inner.store.current_run(&id.workflow_id).await? != *id {
            return Ok(());
        }

        let records = self.inner.store.read(id, 1).await?;
        let Some(terminal) = PendingWork::from_history(&records).terminal else {
            return Ok(());
        };
        if let HistoryEvent::WorkflowContinuedAsNew { new_run_id, .. } = &terminal.event {
            debug!(execution = %id, %new_run_id, "creating missing continue-as-new successor");
            self.dispatch_event(id, &terminal.event).await?;
        }
        Ok(())
    }

    async fn recover_execution(&self, id: &ExecutionId) -> Result<(), ExecutorError> {
        let guard = self.inner.locks.acquire(id).await;
        let info = self.inner.store.get_execution(id).await?;
        let records = self.inner.store.read(id, 1).await?;
        let pending = PendingWork::from_history(&records);

        for activity in pending.activities {
            self.inner.activities.dispatch(
                id.clone(),
                activity.seq,
                activity.activity_type,
                activity.input,
                activity.options,
            );
        }
        for (seq, fire_at) in pending.timers {
            self.inner.timers.schedule(id.clone(), seq, fire_at);
        }
        for child in pending.children {
            match self.inner.store.get_execution(&child.execution).await {
                Ok(_) => self.deliver_child_outcome(id, &child).await?,
                Err(StoreError::ExecutionNotFound(_)) => {
                    self.start_child(id, child.seq, &child.execution, &child.workflow_type, child.input)
                        .await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        drop(guard);

        if let Some(parent) = info.parent {
            self.apply_parent_close(id, &parent).await?;
        }
        self.trigger(id.clone());
        Ok(())
    }

    /// Append the outcome of a child chain that closed without reporting back
    async fn deliver_child_outcome(
        &self,
        parent_id: &ExecutionId,
        child: &OpenChild,
    ) -> Result<(), ExecutorError> {
        let current = self
            .inner
            .store
            .current_run(&child.execution.workflow_id)
            .await?;
        let info = self.inner.store.get_execution(&current).await?;
        if !info.status.is_closed() {
            return Ok(());
        }

        let parent = ParentRef {
            workflow_id: parent_id.workflow_id.clone(),
            run_id: parent_id.run_id,
            seq: child.seq,
        };
        if info.parent.as_ref() != Some(&parent) {
            return Ok(());
        }

        let records = self.inner.store.read(&current, 1).await?;
        if let Some(HistoryEvent::WorkflowCompleted { outcome }) =
            PendingWork::from_history(&records).terminal.map(|r| r.event)
        {
            info!(parent = %parent_id, child = %current, "delivering outcome of closed child");
            self.notify_parent(&parent, outcome).await?;
        }
        Ok(())
    }

    /// Close a running child whose parent closed before applying its policy
    async fn apply_parent_close(
        &self,
        id: &ExecutionId,
        parent: &ParentRef,
    ) -> Result<(), ExecutorError> {
        let parent_id = ExecutionId::new(parent.workflow_id.clone(), parent.run_id);
        match self.inner.store.get_execution(&parent_id).await {
            Ok(info) if info.status.is_closed() => {}
            Ok(_) | Err(StoreError::ExecutionNotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let records = self.inner.store.read(&parent_id, 1).await?;
        let pending = PendingWork::from_history(&records);
        if pending.terminal.is_none() {
            return Ok(());
        }
        if let Some(child) = pending.children.into_iter().find(|c| c.seq == parent.seq) {
            info!(child = %id, parent = %parent_id, policy = ?child.parent_close_policy, "applying parent-close policy");
            self.close_child(&child, &format!("parent workflow {} closed", parent.workflow_id))
                .await?;
        }
        Ok(())
    }
}
