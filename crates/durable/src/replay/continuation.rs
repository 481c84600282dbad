//! Continue-as-new bookkeeping
//!
//! Tracks whether the run has grown past the history threshold and whether
//! workflow code asked to continue as new. The request is only released once
//! no update handler is running.

use serde_json::Value;

/// Where a run stands with respect to continue-as-new
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationState {
    Running,
    /// History length reached the threshold; workflow code may opt in
    Suggested,
    /// Workflow code opted in; waiting for update handlers to finish
    Requested,
    /// The continue-as-new command was emitted
    ContinuedAsNew,
}

#[derive(Debug)]
pub struct ContinuationManager {
    threshold: u64,
    state: ContinuationState,
    input: Option<Value>,
}

impl ContinuationManager {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            state: ContinuationState::Running,
            input: None,
        }
    }

    pub fn state(&self) -> ContinuationState {
        self.state
    }

    /// Record the current history length
    pub fn observe_history_length(&mut self, length: u64) {
        if self.state == ContinuationState::Running && length >= self.threshold {
            self.state = ContinuationState::Suggested;
        }
    }

    pub fn is_suggested(&self) -> bool {
        self.state == ContinuationState::Suggested
    }

    /// Opt in with the successor's input
    ///
    /// Allowed before the threshold. A second request replaces the input.
    pub fn request(&mut self, input: Value) {
        if self.state == ContinuationState::ContinuedAsNew {
            return;
        }
        self.input = Some(input);
        self.state = ContinuationState::Requested;
    }

    pub fn is_requested(&self) -> bool {
        self.state == ContinuationState::Requested
    }

    /// Release the pending request if no handler is running
    pub fn take_ready(&mut self, running_handlers: usize) -> Option<Value> {
        if self.state != ContinuationState::Requested || running_handlers > 0 {
            return None;
        }
        self.state = ContinuationState::ContinuedAsNew;
        self.input.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_suggested_at_threshold() {
        let mut manager = ContinuationManager::new(10);
        manager.observe_history_length(9);
        assert_eq!(manager.state(), ContinuationState::Running);

        manager.observe_history_length(10);
        assert!(manager.is_suggested());
    }

    #[test]
    fn test_request_deferred_while_handlers_run() {
        let mut manager = ContinuationManager::new(10);
        manager.observe_history_length(12);
        manager.request(json!({"balance": 5}));

        assert_eq!(manager.take_ready(1), None);
        assert_eq!(manager.state(), ContinuationState::Requested);

        assert_eq!(manager.take_ready(0), Some(json!({"balance": 5})));
        assert_eq!(manager.state(), ContinuationState::ContinuedAsNew);
        assert_eq!(manager.take_ready(0), None);
    }

    #[test]
    fn test_request_before_threshold() {
        let mut manager = ContinuationManager::new(1_000);
        manager.request(json!(1));
        assert!(manager.is_requested());
        assert_eq!(manager.take_ready(0), Some(json!(1)));
    }

    #[test]
    fn test_request_after_continued_is_ignored() {
        let mut manager = ContinuationManager::new(1);
        manager.request(json!(1));
        manager.take_ready(0);
        manager.request(json!(2));
        assert_eq!(manager.state(), ContinuationState::ContinuedAsNew);
    }
}
