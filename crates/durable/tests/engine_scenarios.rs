//! End-to-end scenarios for the workflow executor
//!
//! Every test runs against the in-memory store. Run with:
//! cargo test -p ledgerflow-durable --test engine_scenarios

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use ledgerflow_durable::activity::{ActivityContext, ActivityError, ActivityErrorKind};
use ledgerflow_durable::engine::{ExecutorConfig, ExecutorError, UpdateStage, WorkflowExecutor};
use ledgerflow_durable::persistence::{
    EventRecord, ExecutionId, ExecutionInfo, ExecutionStatus, HistoryStore, InMemoryHistoryStore,
    NewEvent, NewExecution, StoreError,
};
use ledgerflow_durable::reliability::{RetryPolicy, TimeoutType};
use ledgerflow_durable::replay::WorkflowContext;
use ledgerflow_durable::workflow::{
    ActivityOptions, ChildWorkflowOptions, HistoryEvent, ParentClosePolicy, Workflow,
    WorkflowError, WorkflowErrorKind, WorkflowOutcome,
};
use ledgerflow_durable::ErrorKind;

// =============================================================================
// Helpers
// =============================================================================

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

async fn status_of<S: HistoryStore>(executor: &WorkflowExecutor<S>, workflow_id: &str) -> ExecutionStatus {
    executor.describe(workflow_id).await.unwrap().status
}

fn kinds(records: &[EventRecord]) -> Vec<&'static str> {
    records.iter().map(|r| r.event.kind()).collect()
}

fn count_kind(records: &[EventRecord], kind: &str) -> usize {
    records.iter().filter(|r| r.event.kind() == kind).count()
}

fn workflow_failure(err: ExecutorError) -> WorkflowError {
    match err {
        ExecutorError::WorkflowFailed { error, .. } => error,
        other => panic!("expected WorkflowFailed, got {other:?}"),
    }
}

/// In-memory store that injects a racing client write or a lost append
struct Interposed {
    inner: Arc<InMemoryHistoryStore>,
    /// Append a "close" signal right after every created run
    signal_after_create: bool,
    /// Number of child result appends still to fail
    failing_child_results: AtomicU32,
}

impl Interposed {
    fn signalling(inner: Arc<InMemoryHistoryStore>) -> Self {
        Self {
            inner,
            signal_after_create: true,
            failing_child_results: AtomicU32::new(0),
        }
    }

    fn losing_child_results(inner: Arc<InMemoryHistoryStore>, count: u32) -> Self {
        Self {
            inner,
            signal_after_create: false,
            failing_child_results: AtomicU32::new(count),
        }
    }
}

#[async_trait]
impl HistoryStore for Interposed {
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError> {
        let id = execution.id.clone();
        self.inner.create_execution(execution).await?;
        if self.signal_after_create {
            let close = NewEvent::new(
                "signal-racer",
                HistoryEvent::SignalReceived {
                    name: "close".to_string(),
                    payload: json!(null),
                },
            );
            self.inner.append(&id, close).await?;
        }
        Ok(())
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<ExecutionInfo, StoreError> {
        self.inner.get_execution(id).await
    }

    async fn current_run(&self, workflow_id: &str) -> Result<ExecutionId, StoreError> {
        self.inner.current_run(workflow_id).await
    }

    async fn update_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        self.inner.update_status(id, status, result, error).await
    }

    async fn list_executions(&self, status: ExecutionStatus) -> Result<Vec<ExecutionId>, StoreError> {
        self.inner.list_executions(status).await
    }

    async fn append_events(
        &self,
        id: &ExecutionId,
        expected_sequence: Option<u64>,
        events: Vec<NewEvent>,
    ) -> Result<u64, StoreError> {
        let child_result = events
            .iter()
            .any(|e| matches!(e.event, HistoryEvent::ChildWorkflowCompleted { .. }));
        if child_result
            && self
                .failing_child_results
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Database("connection reset".to_string()));
        }
        self.inner.append_events(id, expected_sequence, events).await
    }

    async fn read(&self, id: &ExecutionId, from_seq: u64) -> Result<Vec<EventRecord>, StoreError> {
        self.inner.read(id, from_seq).await
    }
}

// =============================================================================
// Workflows
// =============================================================================

/// Greets every name in parallel and returns the greetings sorted
struct Greeter;

impl Workflow for Greeter {
    const TYPE: &'static str = "greeter";
    type Input = Vec<String>;
    type Output = Vec<String>;

    fn new(_input: &Self::Input) -> Self {
        Greeter
    }

    fn run(ctx: WorkflowContext<Self>, names: Vec<String>) -> BoxFuture<'static, Result<Vec<String>, WorkflowError>> {
        Box::pin(async move {
            let calls = names.iter().map(|name| ctx.activity("say_hello", json!(name)));
            let mut greetings = Vec::new();
            for greeting in future::join_all(calls).await {
                greetings.push(serde_json::from_value::<String>(greeting?)?);
            }
            greetings.sort();
            Ok(greetings)
        })
    }
}

/// Charges a card with a fixed three-attempt retry policy
struct Checkout;

impl Workflow for Checkout {
    const TYPE: &'static str = "checkout";
    type Input = u64;
    type Output = Value;

    fn new(_input: &u64) -> Self {
        Checkout
    }

    fn run(ctx: WorkflowContext<Self>, amount: u64) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let options = ActivityOptions::default()
                .with_retry(RetryPolicy::fixed(Duration::from_millis(10), 3));
            ctx.activity_with_options("charge_card", json!({ "amount": amount }), options)
                .await
        })
    }
}

/// Fetches a URL under a tight start-to-close timeout
struct Fetch;

impl Workflow for Fetch {
    const TYPE: &'static str = "fetch";
    type Input = String;
    type Output = Value;

    fn new(_input: &String) -> Self {
        Fetch
    }

    fn run(ctx: WorkflowContext<Self>, url: String) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let options = ActivityOptions::default()
                .with_retry(RetryPolicy::fixed(Duration::from_millis(5), 2))
                .with_start_to_close_timeout(Duration::from_millis(30));
            ctx.activity_with_options("http_get", json!(url), options).await
        })
    }
}

/// Runs a long heartbeating task and cleans up when cancelled
struct Transfer;

impl Workflow for Transfer {
    const TYPE: &'static str = "transfer";
    type Input = ();
    type Output = Value;

    fn new(_input: &()) -> Self {
        Transfer
    }

    fn run(ctx: WorkflowContext<Self>, _input: ()) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let options = ActivityOptions::default().with_heartbeat(Duration::from_secs(2));
            match ctx.activity_with_options("move_funds", json!(null), options).await {
                Err(err) if err.is_cancelled() => {
                    ctx.activity("release_hold", json!(null)).await?;
                    Err(err)
                }
                other => other,
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CounterInput {
    count: u64,
    generation: u32,
}

/// Ticks until continue-as-new is suggested while a "hold" update keeps
/// the run open
struct Counter {
    count: u64,
    holding: bool,
    released: bool,
    rolling_over: bool,
}

impl Workflow for Counter {
    const TYPE: &'static str = "counter";
    type Input = CounterInput;
    type Output = u64;

    fn new(input: &CounterInput) -> Self {
        Counter {
            count: input.count,
            holding: false,
            released: false,
            rolling_over: false,
        }
    }

    fn run(ctx: WorkflowContext<Self>, input: CounterInput) -> BoxFuture<'static, Result<u64, WorkflowError>> {
        Box::pin(async move {
            if input.generation > 0 {
                return Ok(input.count);
            }
            ctx.wait_condition(|s: &Counter| s.holding).await?;
            loop {
                ctx.sleep(Duration::from_millis(5)).await?;
                let count = ctx.state_mut(|s| {
                    s.count += 1;
                    s.count
                });
                if ctx.continue_as_new_suggested() {
                    ctx.state_mut(|s| s.rolling_over = true);
                    return ctx
                        .continue_as_new(CounterInput {
                            count,
                            generation: input.generation + 1,
                        })
                        .await;
                }
            }
        })
    }

    fn on_signal(&mut self, name: &str, _payload: Value) {
        if name == "release" {
            self.released = true;
        }
    }

    fn query(&self, name: &str, _args: Value) -> Result<Value, WorkflowError> {
        match name {
            "rolling_over" => Ok(json!(self.rolling_over)),
            "count" => Ok(json!(self.count)),
            other => Err(WorkflowError::new(format!("unknown query: {other}"))),
        }
    }

    fn handle_update(
        ctx: WorkflowContext<Self>,
        _name: String,
        _args: Value,
    ) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        Box::pin(async move {
            ctx.state_mut(|s| s.holding = true);
            ctx.wait_condition(|s: &Counter| s.released).await?;
            Ok(json!(ctx.state(|s| s.count)))
        })
    }
}

/// Holds a balance that updates deposit into until a "close" signal
struct Ledger {
    balance: i64,
    closed: bool,
    notes: Vec<String>,
}

impl Workflow for Ledger {
    const TYPE: &'static str = "ledger";
    type Input = i64;
    type Output = i64;

    fn new(opening: &i64) -> Self {
        Ledger {
            balance: *opening,
            closed: false,
            notes: Vec::new(),
        }
    }

    fn run(ctx: WorkflowContext<Self>, _opening: i64) -> BoxFuture<'static, Result<i64, WorkflowError>> {
        Box::pin(async move {
            ctx.wait_condition(|s: &Ledger| s.closed).await?;
            Ok(ctx.state(|s| s.balance))
        })
    }

    fn on_signal(&mut self, name: &str, payload: Value) {
        match name {
            "close" => self.closed = true,
            "note" => self.notes.push(payload.as_str().unwrap_or_default().to_string()),
            _ => {}
        }
    }

    fn query(&self, name: &str, _args: Value) -> Result<Value, WorkflowError> {
        match name {
            "balance" => Ok(json!(self.balance)),
            "notes" => Ok(json!(self.notes)),
            other => Err(WorkflowError::new(format!("unknown query: {other}"))),
        }
    }

    fn validate_update(&self, _name: &str, args: &Value) -> Result<(), WorkflowError> {
        match args.as_i64() {
            Some(amount) if amount > 0 => Ok(()),
            _ => Err(WorkflowError::new("deposit must be positive").with_code("INVALID_AMOUNT")),
        }
    }

    fn handle_update(
        ctx: WorkflowContext<Self>,
        _name: String,
        args: Value,
    ) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        Box::pin(async move {
            let amount = args.as_i64().unwrap_or_default();
            let balance = ctx.state_mut(|s| {
                s.balance += amount;
                s.balance
            });
            Ok(json!(balance))
        })
    }
}

/// Starts three timers out of order and records the order they fire in
struct Alarms {
    fired: Vec<String>,
}

impl Workflow for Alarms {
    const TYPE: &'static str = "alarms";
    type Input = ();
    type Output = Vec<String>;

    fn new(_input: &()) -> Self {
        Alarms { fired: Vec::new() }
    }

    fn run(ctx: WorkflowContext<Self>, _input: ()) -> BoxFuture<'static, Result<Vec<String>, WorkflowError>> {
        Box::pin(async move {
            let ctx = &ctx;
            let alarms = [("late", 60u64), ("early", 10), ("middle", 35)].map(|(label, ms)| async move {
                ctx.sleep(Duration::from_millis(ms)).await?;
                ctx.state_mut(|s| s.fired.push(label.to_string()));
                Ok::<_, WorkflowError>(())
            });
            future::try_join_all(alarms).await?;
            Ok(ctx.state(|s| s.fired.clone()))
        })
    }
}

/// Sleeps for an hour; used as a child that outlives its parent
struct Sleeper;

impl Workflow for Sleeper {
    const TYPE: &'static str = "sleeper";
    type Input = ();
    type Output = ();

    fn new(_input: &()) -> Self {
        Sleeper
    }

    fn run(ctx: WorkflowContext<Self>, _input: ()) -> BoxFuture<'static, Result<(), WorkflowError>> {
        Box::pin(async move { ctx.sleep(Duration::from_secs(3600)).await })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SupervisorInput {
    child_id: String,
    policy: ParentClosePolicy,
}

/// Starts a sleeper child and completes without waiting for it
struct Supervisor;

impl Workflow for Supervisor {
    const TYPE: &'static str = "supervisor";
    type Input = SupervisorInput;
    type Output = String;

    fn new(_input: &SupervisorInput) -> Self {
        Supervisor
    }

    fn run(ctx: WorkflowContext<Self>, input: SupervisorInput) -> BoxFuture<'static, Result<String, WorkflowError>> {
        Box::pin(async move {
            let options = ChildWorkflowOptions::default().with_parent_close_policy(input.policy);
            let child = ctx.child_workflow::<Sleeper>(input.child_id, (), options);
            let grace = ctx.sleep(Duration::from_millis(20));
            match future::select(child, grace).await {
                future::Either::Left((result, _)) => {
                    result?;
                    Ok("child finished first".to_string())
                }
                future::Either::Right((result, _)) => {
                    result?;
                    Ok("done".to_string())
                }
            }
        })
    }
}

/// First version of a workflow: waits on a timer
struct DriftV1;

impl Workflow for DriftV1 {
    const TYPE: &'static str = "drift";
    type Input = ();
    type Output = ();

    fn new(_input: &()) -> Self {
        DriftV1
    }

    fn run(ctx: WorkflowContext<Self>, _input: ()) -> BoxFuture<'static, Result<(), WorkflowError>> {
        Box::pin(async move { ctx.sleep(Duration::from_secs(3600)).await })
    }
}

/// Incompatible rewrite registered under the same type tag
struct DriftV2;

impl Workflow for DriftV2 {
    const TYPE: &'static str = "drift";
    type Input = ();
    type Output = Value;

    fn new(_input: &()) -> Self {
        DriftV2
    }

    fn run(ctx: WorkflowContext<Self>, _input: ()) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        Box::pin(async move { ctx.activity("audit", json!(null)).await })
    }
}

/// Sleeps briefly and returns a constant
struct Nap;

impl Workflow for Nap {
    const TYPE: &'static str = "nap";
    type Input = ();
    type Output = String;

    fn new(_input: &()) -> Self {
        Nap
    }

    fn run(ctx: WorkflowContext<Self>, _input: ()) -> BoxFuture<'static, Result<String, WorkflowError>> {
        Box::pin(async move {
            ctx.sleep(Duration::from_millis(50)).await?;
            Ok("rested".to_string())
        })
    }
}

/// Runs a credit assessment and returns its verdict
struct Assessor;

impl Workflow for Assessor {
    const TYPE: &'static str = "assessor";
    type Input = bool;
    type Output = String;

    fn new(_reject: &bool) -> Self {
        Assessor
    }

    fn run(ctx: WorkflowContext<Self>, reject: bool) -> BoxFuture<'static, Result<String, WorkflowError>> {
        Box::pin(async move {
            let verdict = ctx.activity("assess", json!(reject)).await?;
            Ok(serde_json::from_value(verdict)?)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReviewInput {
    child_id: String,
    reject: bool,
}

/// Awaits an assessor child and reports its verdict
struct Reviewer;

impl Workflow for Reviewer {
    const TYPE: &'static str = "reviewer";
    type Input = ReviewInput;
    type Output = String;

    fn new(_input: &ReviewInput) -> Self {
        Reviewer
    }

    fn run(ctx: WorkflowContext<Self>, input: ReviewInput) -> BoxFuture<'static, Result<String, WorkflowError>> {
        Box::pin(async move {
            let verdict = ctx
                .child_workflow::<Assessor>(input.child_id, input.reject, ChildWorkflowOptions::default())
                .await?;
            Ok(format!("verdict: {verdict}"))
        })
    }
}

fn review_executor<S: HistoryStore>(store: S) -> WorkflowExecutor<S> {
    WorkflowExecutor::builder(store)
        .register_workflow::<Reviewer>()
        .register_workflow::<Assessor>()
        .register_workflow::<Ledger>()
        .register_activity_fn("assess", |_ctx: ActivityContext, input: Value| async move {
            if input.as_bool().unwrap_or_default() {
                Err(ActivityError::non_retryable("credit limit exceeded"))
            } else {
                Ok(json!("approved"))
            }
        })
        .build()
}

/// Starts two timers with the same duration in one pass
struct Twins {
    fired: Vec<String>,
}

impl Workflow for Twins {
    const TYPE: &'static str = "twins";
    type Input = ();
    type Output = Vec<String>;

    fn new(_input: &()) -> Self {
        Twins { fired: Vec::new() }
    }

    fn run(ctx: WorkflowContext<Self>, _input: ()) -> BoxFuture<'static, Result<Vec<String>, WorkflowError>> {
        Box::pin(async move {
            let ctx = &ctx;
            let timers = ["first", "second"].map(|label| async move {
                ctx.sleep(Duration::from_millis(20)).await?;
                ctx.state_mut(|s| s.fired.push(label.to_string()));
                Ok::<_, WorkflowError>(())
            });
            future::try_join_all(timers).await?;
            Ok(ctx.state(|s| s.fired.clone()))
        })
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_parallel_activities_sorted_result() {
    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Greeter>()
        .register_activity_fn("say_hello", |_ctx: ActivityContext, input: Value| async move {
            let name = input
                .as_str()
                .ok_or_else(|| ActivityError::non_retryable("name must be a string"))?
                .to_string();
            // finish in reverse alphabetical order
            let delay = 60 - 10 * u64::from(name.as_bytes()[0].saturating_sub(b'A'));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!(format!("Hello, {name}!")))
        })
        .build();

    executor
        .start_workflow::<Greeter>("greet-1", vec!["Carol".into(), "Alice".into(), "Bob".into()])
        .await
        .unwrap();

    let result = executor.result("greet-1").await.unwrap();
    assert_eq!(result, json!(["Hello, Alice!", "Hello, Bob!", "Hello, Carol!"]));

    // all three were scheduled by the first pass, before any completion
    let history = executor.history("greet-1").await.unwrap();
    assert_eq!(
        &kinds(&history)[..4],
        &["workflow_started", "activity_scheduled", "activity_scheduled", "activity_scheduled"]
    );
    assert_eq!(count_kind(&history, "activity_completed"), 3);
    assert_eq!(kinds(&history).last(), Some(&"workflow_completed"));
    assert_eq!(status_of(&executor, "greet-1").await, ExecutionStatus::Completed);
}

#[test_log::test(tokio::test)]
async fn test_activity_retries_exhausted_fails_workflow() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Checkout>()
        .register_activity_fn("charge_card", move |_ctx: ActivityContext, _input: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(ActivityError::retryable("card declined").with_type("DECLINED"))
            }
        })
        .build();

    executor.start_workflow::<Checkout>("order-1", 42).await.unwrap();

    let error = workflow_failure(executor.result("order-1").await.unwrap_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(error.kind, WorkflowErrorKind::ActivityFailed);
    assert_eq!(error.root_cause().message, "card declined");
    assert_eq!(error.root_cause().code.as_deref(), Some("DECLINED"));
    assert_eq!(error.error_kind(), ErrorKind::Application);

    let history = executor.history("order-1").await.unwrap();
    let failed = history.iter().find_map(|r| match &r.event {
        HistoryEvent::ActivityFailed { attempts, .. } => Some(*attempts),
        _ => None,
    });
    assert_eq!(failed, Some(3));
    assert_eq!(status_of(&executor, "order-1").await, ExecutionStatus::Failed);
}

#[test_log::test(tokio::test)]
async fn test_start_to_close_timeout_surfaces_as_timeout() {
    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Fetch>()
        .register_activity_fn("http_get", |_ctx: ActivityContext, _input: Value| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, ActivityError>(json!({ "status": 200 }))
        })
        .build();

    executor
        .start_workflow::<Fetch>("fetch-1", "https://example.com".to_string())
        .await
        .unwrap();

    let error = workflow_failure(executor.result("fetch-1").await.unwrap_err());
    assert_eq!(error.error_kind(), ErrorKind::Timeout);

    let history = executor.history("fetch-1").await.unwrap();
    let failure = history.iter().find_map(|r| match &r.event {
        HistoryEvent::ActivityFailed { error, attempts, .. } => Some((error.kind, *attempts)),
        _ => None,
    });
    assert_eq!(
        failure,
        Some((ActivityErrorKind::Timeout(TimeoutType::StartToClose), 2))
    );
}

#[test_log::test(tokio::test)]
async fn test_cancellation_runs_cleanup_then_cancels() {
    let saw_cancel = Arc::new(AtomicBool::new(false));
    let cleanups = Arc::new(AtomicU32::new(0));
    let (seen, cleaned) = (saw_cancel.clone(), cleanups.clone());

    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Transfer>()
        .register_activity_fn("move_funds", move |ctx: ActivityContext, _input: Value| {
            let seen = seen.clone();
            async move {
                ctx.cancelled().await;
                seen.store(true, Ordering::SeqCst);
                Err::<Value, _>(ActivityError::cancelled())
            }
        })
        .register_activity_fn("release_hold", move |_ctx: ActivityContext, _input: Value| {
            let cleaned = cleaned.clone();
            async move {
                cleaned.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ActivityError>(json!("released"))
            }
        })
        .build();

    executor.start_workflow::<Transfer>("transfer-1", ()).await.unwrap();
    wait_until(|| async { executor.activities_in_flight() == 1 }).await;

    assert_ok!(executor.cancel("transfer-1", "customer request").await);
    // a repeated request is a no-op
    assert_ok!(executor.cancel("transfer-1", "customer request").await);

    let error = workflow_failure(executor.result("transfer-1").await.unwrap_err());
    assert_eq!(error.kind, WorkflowErrorKind::Cancelled);
    assert_eq!(error.error_kind(), ErrorKind::Cancelled);
    assert_eq!(status_of(&executor, "transfer-1").await, ExecutionStatus::Cancelled);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    wait_until(|| async { saw_cancel.load(Ordering::SeqCst) }).await;

    let history = executor.history("transfer-1").await.unwrap();
    assert_eq!(count_kind(&history, "workflow_cancel_requested"), 1);
    assert_eq!(count_kind(&history, "activity_cancel_requested"), 1);
    assert_eq!(count_kind(&history, "activity_scheduled"), 2);
    match &history.last().unwrap().event {
        HistoryEvent::WorkflowCompleted {
            outcome: WorkflowOutcome::Cancelled { reason },
        } => assert_eq!(reason, "customer request"),
        other => panic!("unexpected last event: {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_continue_as_new_waits_for_running_update() {
    let config = ExecutorConfig::default().with_continue_as_new_threshold(12);
    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Counter>()
        .with_config(config)
        .build();

    let first_run = executor
        .start_workflow::<Counter>("counter-1", CounterInput { count: 0, generation: 0 })
        .await
        .unwrap();

    let update = tokio::spawn({
        let executor = executor.clone();
        async move {
            executor
                .update_with_id("counter-1", "hold-1", "hold", json!(null))
                .await
        }
    });

    wait_until(|| async {
        executor
            .query("counter-1", "rolling_over", json!(null))
            .await
            .map(|v| v == json!(true))
            .unwrap_or(false)
    })
    .await;

    // the run asked to continue as new but the handler is still running
    tokio::time::sleep(Duration::from_millis(50)).await;
    let info = executor.describe("counter-1").await.unwrap();
    assert_eq!(info.id.run_id, first_run);
    assert_eq!(info.status, ExecutionStatus::Running);
    let history = executor.history("counter-1").await.unwrap();
    assert_eq!(count_kind(&history, "workflow_continued_as_new"), 0);
    assert_eq!(
        executor.update_stage("counter-1", "hold-1").await.unwrap(),
        Some(UpdateStage::Accepted)
    );

    assert_ok!(executor.signal("counter-1", "release", json!(null)).await);

    let held = update.await.unwrap().unwrap();
    let result = executor.result("counter-1").await.unwrap();
    assert_eq!(held, result);
    assert!(result.as_u64().unwrap() > 0);

    let successor = executor.describe("counter-1").await.unwrap();
    assert_ne!(successor.id.run_id, first_run);

    let first = ledgerflow_durable::ExecutionId::new("counter-1", first_run);
    let old_history = executor.history_of(&first).await.unwrap();
    let tail = kinds(&old_history);
    assert_eq!(
        &tail[tail.len() - 2..],
        &["update_completed", "workflow_continued_as_new"]
    );

    let new_history = executor.history("counter-1").await.unwrap();
    match &new_history[0].event {
        HistoryEvent::WorkflowStarted { continued_from, input, .. } => {
            assert_eq!(*continued_from, Some(first_run));
            assert_eq!(input["generation"], json!(1));
        }
        other => panic!("unexpected first event: {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn test_update_validation_and_idempotency() {
    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Ledger>()
        .build();
    executor.start_workflow::<Ledger>("ledger-1", 100).await.unwrap();

    let rejected = assert_err!(
        executor
            .update_with_id("ledger-1", "dep-0", "deposit", json!(-5))
            .await
    );
    match rejected {
        ExecutorError::UpdateRejected { error, .. } => {
            assert_eq!(error.code.as_deref(), Some("INVALID_AMOUNT"))
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(
        executor.update_stage("ledger-1", "dep-0").await.unwrap(),
        Some(UpdateStage::Rejected)
    );
    let history = executor.history("ledger-1").await.unwrap();
    assert_eq!(count_kind(&history, "update_accepted"), 0);

    let balance = executor
        .update_with_id("ledger-1", "dep-1", "deposit", json!(25))
        .await
        .unwrap();
    assert_eq!(balance, json!(125));

    // the same update id returns the recorded outcome without re-running
    let again = executor
        .update_with_id("ledger-1", "dep-1", "deposit", json!(25))
        .await
        .unwrap();
    assert_eq!(again, json!(125));
    assert_eq!(
        executor.query("ledger-1", "balance", json!(null)).await.unwrap(),
        json!(125)
    );

    let history = executor.history("ledger-1").await.unwrap();
    assert_eq!(count_kind(&history, "update_accepted"), 1);
    assert_eq!(count_kind(&history, "update_completed"), 1);
    assert_eq!(
        executor.update_stage("ledger-1", "dep-1").await.unwrap(),
        Some(UpdateStage::Completed)
    );
}

#[test_log::test(tokio::test)]
async fn test_signals_dedupe_and_queries_after_completion() {
    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Ledger>()
        .build();
    executor.start_workflow::<Ledger>("ledger-2", 10).await.unwrap();

    executor
        .signal_with_id("ledger-2", "note-1", "note", json!("opened"))
        .await
        .unwrap();
    executor
        .signal_with_id("ledger-2", "note-1", "note", json!("opened"))
        .await
        .unwrap();
    executor.signal("ledger-2", "close", json!(null)).await.unwrap();

    assert_eq!(executor.result("ledger-2").await.unwrap(), json!(10));

    let history = executor.history("ledger-2").await.unwrap();
    assert_eq!(count_kind(&history, "signal_received"), 2);

    // queries replay closed runs
    assert_eq!(
        executor.query("ledger-2", "notes", json!(null)).await.unwrap(),
        json!(["opened"])
    );
    assert_eq!(
        executor.query("ledger-2", "balance", json!(null)).await.unwrap(),
        json!(10)
    );
    assert!(matches!(
        executor.query("ledger-2", "missing", json!(null)).await,
        Err(ExecutorError::QueryFailed { .. })
    ));

    // a closed run accepts no more updates
    assert!(matches!(
        executor.update("ledger-2", "deposit", json!(5)).await,
        Err(ExecutorError::WorkflowClosed(_))
    ));
}

#[test_log::test(tokio::test)]
async fn test_timers_fire_in_deadline_order() {
    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Alarms>()
        .build();
    executor.start_workflow::<Alarms>("alarms-1", ()).await.unwrap();

    let result = executor.result("alarms-1").await.unwrap();
    assert_eq!(result, json!(["early", "middle", "late"]));

    let history = executor.history("alarms-1").await.unwrap();
    let fired: Vec<u32> = history
        .iter()
        .filter_map(|r| match r.event {
            HistoryEvent::TimerFired { seq } => Some(seq),
            _ => None,
        })
        .collect();
    // sequence ids follow creation order: late=1, early=2, middle=3
    assert_eq!(fired, vec![2, 3, 1]);
}

#[test_log::test(tokio::test)]
async fn test_parent_close_policies() {
    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Supervisor>()
        .register_workflow::<Sleeper>()
        .build();

    for (parent, child, policy, expected) in [
        ("boss-1", "worker-1", ParentClosePolicy::Terminate, ExecutionStatus::Terminated),
        ("boss-2", "worker-2", ParentClosePolicy::RequestCancel, ExecutionStatus::Cancelled),
        ("boss-3", "worker-3", ParentClosePolicy::Abandon, ExecutionStatus::Running),
    ] {
        let input = SupervisorInput {
            child_id: child.to_string(),
            policy,
        };
        executor.start_workflow::<Supervisor>(parent, input).await.unwrap();
        assert_eq!(executor.result(parent).await.unwrap(), json!("done"));

        wait_until(|| async { status_of(&executor, child).await == expected }).await;

        let child_history = executor.history(child).await.unwrap();
        match &child_history[0].event {
            HistoryEvent::WorkflowStarted { parent: Some(link), .. } => {
                assert_eq!(link.workflow_id, parent)
            }
            other => panic!("unexpected first event: {other:?}"),
        }
    }

    executor.terminate("worker-3", "test over").await.unwrap();
    assert!(matches!(
        executor.terminate("worker-3", "again").await,
        Err(ExecutorError::WorkflowClosed(_))
    ));
}

#[test_log::test(tokio::test)]
async fn test_incompatible_code_change_halts_execution() {
    let store = Arc::new(InMemoryHistoryStore::new());

    let original = WorkflowExecutor::builder(store.clone())
        .register_workflow::<DriftV1>()
        .build();
    original.start_workflow::<DriftV1>("drift-1", ()).await.unwrap();
    original.shutdown();

    let audits = Arc::new(AtomicU32::new(0));
    let counter = audits.clone();
    let upgraded = WorkflowExecutor::builder(store.clone())
        .register_workflow::<DriftV2>()
        .register_activity_fn("audit", move |_ctx: ActivityContext, _input: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ActivityError>(json!(null))
            }
        })
        .build();

    let before = store.event_count();
    upgraded.signal("drift-1", "poke", json!(null)).await.unwrap();
    wait_until(|| async { status_of(&upgraded, "drift-1").await == ExecutionStatus::Halted }).await;

    // only the signal was appended; no terminal event, no new command
    assert_eq!(store.event_count(), before + 1);
    assert_eq!(audits.load(Ordering::SeqCst), 0);

    let error = workflow_failure(upgraded.result("drift-1").await.unwrap_err());
    assert_eq!(error.error_kind(), ErrorKind::NonDeterminism);
}

#[test_log::test(tokio::test)]
async fn test_recover_resumes_open_runs() {
    let store = Arc::new(InMemoryHistoryStore::new());

    let crashed = WorkflowExecutor::builder(store.clone())
        .register_workflow::<Nap>()
        .build();
    crashed.start_workflow::<Nap>("nap-1", ()).await.unwrap();
    crashed.shutdown();
    drop(crashed);

    let restarted = WorkflowExecutor::builder(store.clone())
        .register_workflow::<Nap>()
        .build();
    assert_eq!(restarted.recover().await.unwrap(), 1);
    assert_eq!(restarted.result("nap-1").await.unwrap(), json!("rested"));

    let history = restarted.history("nap-1").await.unwrap();
    assert_eq!(count_kind(&history, "timer_fired"), 1);
}

#[test_log::test(tokio::test)]
async fn test_duplicate_workflow_id_rejected_while_running() {
    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Ledger>()
        .build();
    executor.start_workflow::<Ledger>("ledger-3", 0).await.unwrap();

    let err = executor
        .start_workflow::<Ledger>("ledger-3", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::WorkflowAlreadyRunning(_)));

    executor.signal("ledger-3", "close", json!(null)).await.unwrap();
    executor.result("ledger-3").await.unwrap();

    // a closed id can be reused for a new run
    executor.start_workflow::<Ledger>("ledger-3", 7).await.unwrap();
    executor.signal("ledger-3", "close", json!(null)).await.unwrap();
    assert_eq!(executor.result("ledger-3").await.unwrap(), json!(7));
}

#[test_log::test(tokio::test)]
async fn test_child_results_reach_awaiting_parent() {
    let executor = review_executor(InMemoryHistoryStore::new());

    let approve = ReviewInput {
        child_id: "assess-ok".to_string(),
        reject: false,
    };
    executor.start_workflow::<Reviewer>("review-ok", approve).await.unwrap();
    assert_eq!(executor.result("review-ok").await.unwrap(), json!("verdict: approved"));
    let history = executor.history("review-ok").await.unwrap();
    assert_eq!(count_kind(&history, "child_workflow_completed"), 1);

    let reject = ReviewInput {
        child_id: "assess-no".to_string(),
        reject: true,
    };
    executor.start_workflow::<Reviewer>("review-no", reject).await.unwrap();
    let error = workflow_failure(executor.result("review-no").await.unwrap_err());
    let chain: Vec<WorkflowErrorKind> = error.chain().map(|e| e.kind).collect();
    assert_eq!(
        chain,
        vec![
            WorkflowErrorKind::ChildWorkflowFailed,
            WorkflowErrorKind::ActivityFailed,
            WorkflowErrorKind::Application,
        ]
    );
    assert_eq!(error.root_cause().message, "credit limit exceeded");
    assert_eq!(status_of(&executor, "assess-no").await, ExecutionStatus::Failed);
}

#[test_log::test(tokio::test)]
async fn test_child_start_failure_reaches_parent() {
    let executor = review_executor(InMemoryHistoryStore::new());
    executor.start_workflow::<Ledger>("assess-busy", 0).await.unwrap();

    let input = ReviewInput {
        child_id: "assess-busy".to_string(),
        reject: false,
    };
    executor.start_workflow::<Reviewer>("review-busy", input).await.unwrap();
    let error = workflow_failure(executor.result("review-busy").await.unwrap_err());
    assert_eq!(error.kind, WorkflowErrorKind::ChildWorkflowFailed);
    assert_eq!(error.root_cause().code.as_deref(), Some("CHILD_START_FAILED"));

    // the running workflow that owns the id is untouched
    assert_eq!(status_of(&executor, "assess-busy").await, ExecutionStatus::Running);
    assert_eq!(count_kind(&executor.history("assess-busy").await.unwrap(), "workflow_started"), 1);
}

#[test_log::test(tokio::test)]
async fn test_equal_deadline_timers_fire_in_start_order() {
    let executor = WorkflowExecutor::builder(InMemoryHistoryStore::new())
        .register_workflow::<Twins>()
        .build();
    executor.start_workflow::<Twins>("twins-1", ()).await.unwrap();

    assert_eq!(executor.result("twins-1").await.unwrap(), json!(["first", "second"]));

    let history = executor.history("twins-1").await.unwrap();
    let deadlines: Vec<_> = history
        .iter()
        .filter_map(|r| match r.event {
            HistoryEvent::TimerStarted { fire_at, .. } => Some(fire_at),
            _ => None,
        })
        .collect();
    assert_eq!(deadlines.len(), 2);
    assert_eq!(deadlines[0], deadlines[1]);

    let fired: Vec<u32> = history
        .iter()
        .filter_map(|r| match r.event {
            HistoryEvent::TimerFired { seq } => Some(seq),
            _ => None,
        })
        .collect();
    assert_eq!(fired, vec![1, 2]);
}

#[test_log::test(tokio::test)]
async fn test_signal_racing_start_is_replayed() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let executor = WorkflowExecutor::builder(Interposed::signalling(store.clone()))
        .register_workflow::<Ledger>()
        .build();

    assert_ok!(executor.start_workflow::<Ledger>("ledger-race", 5).await);
    assert_eq!(executor.result("ledger-race").await.unwrap(), json!(5));

    let history = executor.history("ledger-race").await.unwrap();
    assert_eq!(
        kinds(&history),
        vec!["workflow_started", "signal_received", "workflow_completed"]
    );
}

#[test_log::test(tokio::test)]
async fn test_recover_delivers_result_of_closed_child() {
    let store = Arc::new(InMemoryHistoryStore::new());
    let lossy = Arc::new(Interposed::losing_child_results(store.clone(), 1));

    let crashed = review_executor(lossy.clone());
    let input = ReviewInput {
        child_id: "assess-lost".to_string(),
        reject: false,
    };
    crashed.start_workflow::<Reviewer>("review-lost", input).await.unwrap();

    wait_until(|| async { status_of(&crashed, "assess-lost").await == ExecutionStatus::Completed }).await;
    wait_until(|| async { lossy.failing_child_results.load(Ordering::SeqCst) == 0 }).await;
    assert_eq!(status_of(&crashed, "review-lost").await, ExecutionStatus::Running);
    crashed.shutdown();
    drop(crashed);

    let restarted = review_executor(store.clone());
    assert_eq!(restarted.recover().await.unwrap(), 1);
    assert_eq!(restarted.result("review-lost").await.unwrap(), json!("verdict: approved"));

    let history = restarted.history("review-lost").await.unwrap();
    assert_eq!(count_kind(&history, "child_workflow_completed"), 1);
}
