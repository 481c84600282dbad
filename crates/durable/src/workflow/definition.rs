//! Workflow trait definition

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::WorkflowError;
use crate::replay::WorkflowContext;

/// A workflow is deterministic orchestration code re-executed against its history
///
/// The implementing struct is the workflow's state. The entry computation
/// ([`run`](Self::run)) and update handlers reach it through
/// [`WorkflowContext::state`] and [`WorkflowContext::state_mut`]; signal,
/// query and validation hooks receive it directly.
///
/// # Determinism
///
/// Given the same history, `run` must issue the same activities, timers and
/// child workflows in the same order. Use the context for time
/// ([`WorkflowContext::now`]) and randomness ([`WorkflowContext::uuid`])
/// instead of the system clock. Divergence halts the execution with a
/// [`NonDeterminismError`](crate::NonDeterminismError).
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::prelude::*;
///
/// #[derive(Default)]
/// struct Greeter {
///     greetings: Vec<String>,
/// }
///
/// impl Workflow for Greeter {
///     const TYPE: &'static str = "greeter";
///     type Input = Vec<String>;
///     type Output = Vec<String>;
///
///     fn new(_input: &Self::Input) -> Self {
///         Self::default()
///     }
///
///     fn run(
///         ctx: WorkflowContext<Self>,
///         names: Self::Input,
///     ) -> BoxFuture<'static, Result<Self::Output, WorkflowError>> {
///         Box::pin(async move {
///             let calls = names
///                 .into_iter()
///                 .map(|name| ctx.activity("say_hello", json!(name)));
///             let mut greetings = Vec::new();
///             for result in futures::future::join_all(calls).await {
///                 greetings.push(serde_json::from_value(result?)?);
///             }
///             greetings.sort();
///             Ok(greetings)
///         })
///     }
/// }
/// ```
pub trait Workflow: Sized + Send + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone + 'static;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Create the initial state from the start input
    ///
    /// Called on every replay, so it must not have side effects.
    fn new(input: &Self::Input) -> Self;

    /// Entry computation
    fn run(
        ctx: WorkflowContext<Self>,
        input: Self::Input,
    ) -> BoxFuture<'static, Result<Self::Output, WorkflowError>>;

    /// Called when a signal is applied
    fn on_signal(&mut self, name: &str, payload: Value) {
        let _ = (name, payload);
    }

    /// Read-only inspection of the current state
    fn query(&self, name: &str, args: Value) -> Result<Value, WorkflowError> {
        let _ = args;
        Err(WorkflowError::new(format!("unknown query: {name}")).with_code("UNKNOWN_QUERY"))
    }

    /// Validator for an update; a rejection leaves no trace in history
    fn validate_update(&self, name: &str, args: &Value) -> Result<(), WorkflowError> {
        let _ = (name, args);
        Ok(())
    }

    /// Update handler, started when the update is accepted
    ///
    /// Runs concurrently with `run`. The execution does not complete or
    /// continue as new while any handler is still running.
    fn handle_update(
        ctx: WorkflowContext<Self>,
        name: String,
        args: Value,
    ) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        let _ = (ctx, args);
        Box::pin(async move {
            Err(WorkflowError::new(format!("unknown update: {name}")).with_code("UNKNOWN_UPDATE"))
        })
    }
}
