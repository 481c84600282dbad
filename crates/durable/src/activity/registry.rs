//! Lookup table from activity type tag to handler

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use super::{Activity, ActivityContext, ActivityError};
use crate::persistence::ExecutionId;

/// One dispatchable activity invocation
#[derive(Debug, Clone)]
pub struct ActivityTask {
    /// Execution that scheduled the activity
    pub execution: ExecutionId,
    /// Sequence id of the activity within the execution
    pub seq: u32,
    /// Unique id of this attempt
    pub invocation_id: Uuid,
    /// Type tag used for handler lookup
    pub activity_type: String,
    /// Serialized arguments
    pub input: Value,
    /// Attempt number (1-based)
    pub attempt: u32,
}

/// Boundary between the orchestrator and whatever runs activity code
///
/// The orchestrator owns retries, timeouts and cancellation; an executor only
/// has to run a single attempt.
#[async_trait]
pub trait ActivityExecutor: Send + Sync + 'static {
    /// Run one attempt of `task`
    async fn execute(&self, task: ActivityTask, ctx: ActivityContext) -> Result<Value, ActivityError>;
}

/// Type-erased activity handler
pub type ActivityHandler =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync>;

/// Registry mapping activity type tags to handlers
///
/// # Example
///
/// ```ignore
/// let mut activities = ActivityRegistry::new();
/// activities.register(HttpGet);
/// activities.register_fn("say_hello", |_ctx, input| async move {
///     let name: String = serde_json::from_value(input)?;
///     Ok(serde_json::json!(format!("Hello, {name}!")))
/// });
/// ```
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity under its `TYPE` tag
    pub fn register<A: Activity>(&mut self, activity: A) -> &mut Self {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(
            move |ctx: ActivityContext, input: Value| -> BoxFuture<'static, Result<Value, ActivityError>> {
                let activity = activity.clone();
                Box::pin(async move {
                    let input: A::Input = serde_json::from_value(input)?;
                    let output = activity.execute(&ctx, input).await?;
                    Ok::<_, ActivityError>(serde_json::to_value(output)?)
                })
            },
        );
        self.handlers.insert(A::TYPE.to_string(), handler);
        self
    }

    /// Register a closure handling raw JSON input
    pub fn register_fn<F, Fut>(&mut self, activity_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(
            move |ctx: ActivityContext, input: Value| -> BoxFuture<'static, Result<Value, ActivityError>> {
                Box::pin(f(ctx, input))
            },
        );
        self.handlers.insert(activity_type.into(), handler);
        self
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered activity types
    pub fn activity_types(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}

#[async_trait]
impl ActivityExecutor for ActivityRegistry {
    async fn execute(&self, task: ActivityTask, ctx: ActivityContext) -> Result<Value, ActivityError> {
        let handler = self.handlers.get(&task.activity_type).cloned().ok_or_else(|| {
            ActivityError::non_retryable(format!(
                "no handler registered for activity type '{}'",
                task.activity_type
            ))
            .with_type("UNKNOWN_ACTIVITY")
        })?;
        handler(ctx, task.input).await
    }
}
