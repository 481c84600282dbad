//! Activity trait and typed activity failures

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;
use crate::error::ErrorKind;
use crate::reliability::TimeoutType;

/// Typed failure category of an activity attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityErrorKind {
    /// Business-logic failure raised by the handler
    #[default]
    Application,
    /// The orchestrator enforced a timeout
    Timeout(TimeoutType),
    /// The invocation observed cancellation
    Cancelled,
}

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Failure category
    #[serde(default)]
    pub kind: ActivityErrorKind,

    /// Error type/code for programmatic handling
    ///
    /// Matched against [`RetryPolicy::non_retryable_errors`](crate::RetryPolicy).
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors will immediately fail the activity
    /// without further retry attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ActivityErrorKind::Application,
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::retryable(message)
        }
    }

    /// A timeout enforced by the orchestrator; retryable per policy
    pub fn timeout(timeout_type: TimeoutType) -> Self {
        Self {
            message: format!("activity {timeout_type} timeout exceeded"),
            kind: ActivityErrorKind::Timeout(timeout_type),
            error_type: Some("Timeout".to_string()),
            retryable: true,
            details: None,
        }
    }

    /// The invocation was cancelled; never retried
    pub fn cancelled() -> Self {
        Self {
            message: "activity cancelled".to_string(),
            kind: ActivityErrorKind::Cancelled,
            error_type: Some("Cancelled".to_string()),
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ActivityErrorKind::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ActivityErrorKind::Cancelled
    }

    /// Taxonomy classification
    pub fn error_kind(&self) -> ErrorKind {
        match self.kind {
            ActivityErrorKind::Application => ErrorKind::Application,
            ActivityErrorKind::Timeout(_) => ErrorKind::Timeout,
            ActivityErrorKind::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(err.to_string()).with_type("SERIALIZATION")
    }
}

/// An activity is a unit of work that may fail and be retried
///
/// Activities are the only place workflow logic touches the outside world.
/// They run outside the replay engine, may take a long time, and are retried
/// by the orchestrator according to the [`ActivityOptions`](crate::ActivityOptions)
/// they were scheduled with.
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::prelude::*;
///
/// struct HttpGet;
///
/// #[async_trait]
/// impl Activity for HttpGet {
///     const TYPE: &'static str = "http_get";
///     type Input = String;
///     type Output = String;
///
///     async fn execute(&self, ctx: &ActivityContext, url: String) -> Result<String, ActivityError> {
///         ctx.heartbeat(None).await?;
///         Ok(fetch(&url).await?)
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Type tag used to look up the activity in the registry
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute one attempt of the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_error_constructors() {
        assert!(ActivityError::retryable("flaky").retryable);
        assert!(!ActivityError::non_retryable("bad input").retryable);

        let timeout = ActivityError::timeout(TimeoutType::Heartbeat);
        assert!(timeout.retryable);
        assert!(timeout.is_timeout());
        assert_eq!(timeout.error_kind(), ErrorKind::Timeout);

        let cancelled = ActivityError::cancelled();
        assert!(!cancelled.retryable);
        assert_eq!(cancelled.error_kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_anyhow_conversion_is_retryable() {
        let err: ActivityError = anyhow::anyhow!("connection reset").into();
        assert!(err.retryable);
        assert_eq!(err.kind, ActivityErrorKind::Application);
        assert_eq!(err.to_string(), "connection reset");
    }

    #[test]
    fn test_kind_defaults_when_missing() {
        let json = r#"{"message":"x","error_type":null,"retryable":true,"details":null}"#;
        let parsed: ActivityError = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.kind, ActivityErrorKind::Application);
    }
}
