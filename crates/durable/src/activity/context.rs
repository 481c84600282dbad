//! Activity execution context

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::persistence::ExecutionId;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (attempt already timed out)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Activity was cancelled
    #[error("activity was cancelled")]
    Cancelled,
}

impl From<HeartbeatError> for super::ActivityError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::Cancelled => Self::cancelled(),
            HeartbeatError::ChannelClosed => Self::retryable(err.to_string()),
        }
    }
}

/// Context handed to an activity handler for one attempt
///
/// Heartbeats keep a long-running invocation alive when the activity was
/// scheduled with a heartbeat timeout. The same channel is how cancellation
/// reaches the handler: once the owning workflow cancels the activity (or
/// closes), [`heartbeat`](Self::heartbeat) returns
/// [`HeartbeatError::Cancelled`] and [`cancelled`](Self::cancelled) resolves.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Unique id of this invocation attempt
    pub invocation_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the retry policy
    pub max_attempts: u32,

    /// Execution that scheduled this activity
    pub execution: ExecutionId,

    /// Sequence id of the activity within its execution
    pub seq: u32,

    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,

    cancellation: CancellationToken,
}

impl ActivityContext {
    pub fn new(execution: ExecutionId, seq: u32, attempt: u32, max_attempts: u32) -> Self {
        Self {
            invocation_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            execution,
            seq,
            heartbeat_tx: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attach the heartbeat channel watched by the orchestrator
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Tie this attempt to an existing cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Token that cancels this attempt
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Record a heartbeat
    ///
    /// # Errors
    ///
    /// Returns an error if the activity has been cancelled or the
    /// heartbeat channel is closed.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => return Err(ActivityError::cancelled()),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
