#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end tests for SIMPLE tasks: routing, retries, priorities,
//! cancellation, monitoring and recurring schedules.

use async_trait::async_trait;
use conductor_agent::*;
use conductor_core::*;
use conductor_orchestrator::*;
use conductor_store::{FileTaskStore, MemoryTaskStore, TaskStore};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Test agents
// ---------------------------------------------------------------------------

/// Fails the first `failures` calls with the given error, then echoes the payload.
struct Flaky {
    calls: AtomicU32,
    failures: u32,
    error: fn(u32) -> AgentError,
}

impl Flaky {
    fn new(failures: u32, error: fn(u32) -> AgentError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures,
            error,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for Flaky {
    async fn initialize(&self, _options: &Value) -> Result<(), AgentError> {
        Ok(())
    }

    async fn execute(&self, input: AgentInput) -> Result<Value, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err((self.error)(input.attempt));
        }
        Ok(input.payload)
    }

    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        AgentStatus::new(AgentState::Ready)
    }
}

fn boom(attempt: u32) -> AgentError {
    AgentError::exec(format!("boom on attempt {attempt}"))
}

fn rejected(_attempt: u32) -> AgentError {
    AgentError::exec("malformed input").non_retryable()
}

/// Records payloads in execution order.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Value>>,
}

#[async_trait]
impl Agent for Recorder {
    async fn initialize(&self, _options: &Value) -> Result<(), AgentError> {
        Ok(())
    }

    async fn execute(&self, input: AgentInput) -> Result<Value, AgentError> {
        self.seen.lock().push(input.payload.clone());
        Ok(input.payload)
    }

    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        AgentStatus::new(AgentState::Ready)
    }
}

/// Signals `entered`, then blocks until `release` fires.
#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Agent for Gate {
    async fn initialize(&self, _options: &Value) -> Result<(), AgentError> {
        Ok(())
    }

    async fn execute(&self, input: AgentInput) -> Result<Value, AgentError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(input.payload)
    }

    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        AgentStatus::new(AgentState::Ready)
    }
}

/// Never answers within any sane timeout.
struct Sleeper;

#[async_trait]
impl Agent for Sleeper {
    async fn initialize(&self, _options: &Value) -> Result<(), AgentError> {
        Ok(())
    }

    async fn execute(&self, _input: AgentInput) -> Result<Value, AgentError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }

    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        AgentStatus::new(AgentState::Ready)
    }
}

/// Sleeps for `work`, recording when each execution started.
struct Timed {
    work: Duration,
    starts: Mutex<Vec<tokio::time::Instant>>,
}

impl Timed {
    fn new(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            starts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Agent for Timed {
    async fn initialize(&self, _options: &Value) -> Result<(), AgentError> {
        Ok(())
    }

    async fn execute(&self, input: AgentInput) -> Result<Value, AgentError> {
        self.starts.lock().push(tokio::time::Instant::now());
        tokio::time::sleep(self.work).await;
        Ok(input.payload)
    }

    async fn stop(&self) -> Result<(), AgentError> {
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        AgentStatus::new(AgentState::Ready)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.queue.concurrency = 2;
    config.queue.rate_limit.tokens = 0;
    config.queue.retry = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50));
    config.monitor.log_events = false;
    config
}

async fn build(config: ConductorConfig) -> Orchestrator {
    Orchestrator::builder(config)
        .with_store(Arc::new(MemoryTaskStore::new()))
        .build()
        .await
        .unwrap()
}

fn register(orch: &Orchestrator, id: &str, agent: Arc<dyn Agent>) {
    orch.register_agent(AgentDescriptor::new(id, id, "1.0.0"), agent)
        .unwrap();
}

async fn wait(orch: &Orchestrator, task_id: TaskId) -> TaskState {
    tokio::time::timeout(Duration::from_secs(10), orch.wait(task_id))
        .await
        .expect("task did not finish in time")
        .unwrap()
}

fn with_attempts(n: u32) -> TaskOptions {
    TaskOptions::default().with_max_attempts(n)
}

// ---------------------------------------------------------------------------
// Scheduling and classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduled_task_is_pending_and_queryable() {
    let orch = build(test_config()).await;
    register(&orch, "echo", Flaky::new(0, boom));

    let id = orch
        .schedule(TaskRequest::simple("echo", json!({"n": 1})))
        .await
        .unwrap();
    let state = orch.get_status(id).unwrap();
    assert_eq!(state.status, TaskStatus::Pending);
    assert_eq!(state.attempts, 0);
    assert!(state.started_at.is_none());

    orch.start().await.unwrap();
    let done = wait(&orch, id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!({"n": 1})));
    assert_eq!(done.attempts, 1);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_submissions_create_no_state() {
    let orch = build(test_config()).await;
    register(&orch, "echo", Flaky::new(0, boom));

    let err = orch
        .schedule(TaskRequest::new("echo", "BATCH", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::Classification(_)));

    let err = orch
        .schedule(TaskRequest::simple("ghost", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::UnknownAgent(ref id) if id == "ghost"));

    assert!(orch.list_tasks(&TaskFilter::default()).is_empty());
}

#[tokio::test]
async fn class_is_case_insensitive() {
    let orch = build(test_config()).await;
    register(&orch, "echo", Flaky::new(0, boom));
    let id = orch
        .schedule(TaskRequest::new("echo", "simple", json!({})))
        .await
        .unwrap();
    assert_eq!(
        orch.get_task(id).unwrap().descriptor.task_class,
        TaskClass::Simple
    );
}

#[tokio::test]
async fn identical_payloads_get_distinct_ids() {
    let orch = build(test_config()).await;
    register(&orch, "echo", Flaky::new(0, boom));
    let a = orch
        .schedule(TaskRequest::simple("echo", json!({"same": true})))
        .await
        .unwrap();
    let b = orch
        .schedule(TaskRequest::simple("echo", json!({"same": true})))
        .await
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(orch.list_tasks(&TaskFilter::default()).len(), 2);
}

// ---------------------------------------------------------------------------
// Retries and timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn always_failing_task_uses_every_attempt() {
    let orch = build(test_config()).await;
    let agent = Flaky::new(u32::MAX, boom);
    register(&orch, "flaky", agent.clone());
    orch.start().await.unwrap();

    let id = orch
        .schedule(TaskRequest::simple("flaky", json!({"file": "a.php"})).with_options(with_attempts(3)))
        .await
        .unwrap();
    let state = wait(&orch, id).await;

    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(state.attempts, 3);
    assert_eq!(agent.calls(), 3);
    let error = state.error.unwrap();
    assert_eq!(error.attempt, 3);
    assert_eq!(error.kind, AgentErrorKind::Exec);
    assert!(error.message.contains("boom on attempt 3"));
    assert_eq!(error.payload, Some(json!({"file": "a.php"})));
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn transient_failure_recovers() {
    let orch = build(test_config()).await;
    let agent = Flaky::new(2, boom);
    register(&orch, "flaky", agent.clone());
    orch.start().await.unwrap();

    let id = orch
        .schedule(TaskRequest::simple("flaky", json!("ok")).with_options(with_attempts(3)))
        .await
        .unwrap();
    let state = wait(&orch, id).await;
    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(state.attempts, 3);
    assert!(!state.metadata.contains_key(RETRY_IN_MS));
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn non_retryable_error_fails_immediately() {
    let orch = build(test_config()).await;
    let agent = Flaky::new(u32::MAX, rejected);
    register(&orch, "strict", agent.clone());
    orch.start().await.unwrap();

    let id = orch
        .schedule(TaskRequest::simple("strict", json!({})).with_options(with_attempts(5)))
        .await
        .unwrap();
    let state = wait(&orch, id).await;
    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(state.attempts, 1);
    assert_eq!(agent.calls(), 1);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn attempt_timeout_is_retryable() {
    let orch = build(test_config()).await;
    register(&orch, "slow", Arc::new(Sleeper));
    orch.start().await.unwrap();

    let id = orch
        .schedule(
            TaskRequest::simple("slow", json!({})).with_options(
                with_attempts(2).with_timeout(Duration::from_millis(50)),
            ),
        )
        .await
        .unwrap();
    let state = wait(&orch, id).await;
    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(state.attempts, 2);
    assert_eq!(state.error.unwrap().kind, AgentErrorKind::Timeout);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn waiting_for_a_busy_agent_does_not_count_against_timeout() {
    let mut config = test_config();
    config.queue.concurrency = 2;
    let orch = build(config).await;
    // Not reentrant: the two executions run one after the other.
    let agent = Timed::new(Duration::from_millis(200));
    register(&orch, "slow", agent.clone());
    orch.start().await.unwrap();

    let options = with_attempts(1).with_timeout(Duration::from_millis(300));
    let mut ids = Vec::new();
    for n in 0..2 {
        ids.push(
            orch.schedule(TaskRequest::simple("slow", json!(n)).with_options(options.clone()))
                .await
                .unwrap(),
        );
    }
    for id in ids {
        let state = wait(&orch, id).await;
        assert_eq!(state.status, TaskStatus::Completed, "{:?}", state.error);
        assert_eq!(state.attempts, 1);
    }
    assert_eq!(agent.starts.lock().len(), 2);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn unregistered_agent_fails_at_dispatch() {
    let orch = build(test_config()).await;
    register(&orch, "echo", Flaky::new(0, boom));
    let id = orch
        .schedule(TaskRequest::simple("echo", json!({})))
        .await
        .unwrap();
    assert!(orch.unregister_agent("echo").await.unwrap());

    orch.start().await.unwrap();
    let state = wait(&orch, id).await;
    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(state.attempts, 1);
    assert_eq!(state.error.unwrap().kind, AgentErrorKind::Dispatch);
    orch.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn higher_priority_runs_first() {
    let mut config = test_config();
    config.queue.concurrency = 1;
    let orch = build(config).await;
    let recorder = Arc::new(Recorder::default());
    register(&orch, "rec", recorder.clone());

    let low = orch
        .schedule(
            TaskRequest::simple("rec", json!("low"))
                .with_options(TaskOptions::default().with_priority(1)),
        )
        .await
        .unwrap();
    let high = orch
        .schedule(
            TaskRequest::simple("rec", json!("high"))
                .with_options(TaskOptions::default().with_priority(5)),
        )
        .await
        .unwrap();
    let also_high = orch
        .schedule(
            TaskRequest::simple("rec", json!("high-2"))
                .with_options(TaskOptions::default().with_priority(5)),
        )
        .await
        .unwrap();

    orch.start().await.unwrap();
    for id in [low, high, also_high] {
        wait(&orch, id).await;
    }
    assert_eq!(
        *recorder.seen.lock(),
        vec![json!("high"), json!("high-2"), json!("low")]
    );
    let high_started = orch.get_status(high).unwrap().started_at.unwrap();
    let low_started = orch.get_status(low).unwrap().started_at.unwrap();
    assert!(high_started <= low_started);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn subscribers_see_reports_in_order() {
    let orch = build(test_config()).await;
    register(&orch, "flaky", Flaky::new(2, boom));
    let mut stream = orch.subscribe(|d, _| d.agent_id == "flaky");
    orch.start().await.unwrap();

    let id = orch
        .schedule(TaskRequest::simple("flaky", json!({})).with_options(with_attempts(3)))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(state) = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .unwrap()
    {
        assert_eq!(state.task_id, id);
        let terminal = state.is_terminal();
        seen.push(state);
        if terminal {
            break;
        }
    }

    assert_eq!(seen.first().unwrap().status, TaskStatus::Pending);
    assert_eq!(seen.last().unwrap().status, TaskStatus::Completed);
    for pair in seen.windows(2) {
        assert!(pair[0].attempts <= pair[1].attempts);
        assert!(pair[0].last_updated_at <= pair[1].last_updated_at);
    }
    let retries = seen
        .iter()
        .filter(|s| s.metadata.contains_key(RETRY_IN_MS))
        .count();
    assert!(retries >= 2);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn list_filters_by_status_and_agent() {
    let orch = build(test_config()).await;
    register(&orch, "echo", Flaky::new(0, boom));
    register(&orch, "strict", Flaky::new(u32::MAX, rejected));
    orch.start().await.unwrap();

    let ok = orch.schedule(TaskRequest::simple("echo", json!(1))).await.unwrap();
    let bad = orch.schedule(TaskRequest::simple("strict", json!(2))).await.unwrap();
    wait(&orch, ok).await;
    wait(&orch, bad).await;

    let failed = orch.list_tasks(&TaskFilter::default().with_status(TaskStatus::Failed));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].descriptor.task_id, bad);
    let echo = orch.list_tasks(&TaskFilter::default().with_agent("echo"));
    assert_eq!(echo.len(), 1);
    assert_eq!(echo[0].descriptor.task_id, ok);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn idle_workers_do_not_bank_rate_limit_tokens() {
    let mut config = test_config();
    config.queue.concurrency = 4;
    config.queue.rate_limit.tokens = 1;
    config.queue.rate_limit.refill_interval_ms = 1_000;
    let orch = build(config).await;
    let agent = Timed::new(Duration::ZERO);
    register(&orch, "stamp", agent.clone());
    orch.start().await.unwrap();

    // Several refill intervals pass with every worker idle.
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let submitted = tokio::time::Instant::now();
    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            orch.schedule(TaskRequest::simple("stamp", json!(n)))
                .await
                .unwrap(),
        );
    }
    for id in ids {
        assert_eq!(wait(&orch, id).await.status, TaskStatus::Completed);
    }

    let starts = agent.starts.lock().clone();
    assert_eq!(starts.len(), 3);
    let burst = starts
        .iter()
        .filter(|t| t.duration_since(submitted) < Duration::from_millis(300))
        .count();
    assert_eq!(burst, 1, "one token per interval, even after idling");
    for pair in starts.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(400));
    }
    orch.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Cancellation and retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_terminal_task_returns_false() {
    let orch = build(test_config()).await;
    register(&orch, "echo", Flaky::new(0, boom));
    orch.start().await.unwrap();
    let id = orch.schedule(TaskRequest::simple("echo", json!({}))).await.unwrap();
    wait(&orch, id).await;

    assert!(!orch.cancel(id).await.unwrap());
    assert_eq!(orch.get_status(id).unwrap().status, TaskStatus::Completed);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_unknown_task_is_not_found() {
    let orch = build(test_config()).await;
    let id = uuid::Uuid::new_v4();
    assert_eq!(orch.cancel(id).await.unwrap_err(), CancelError::NotFound(id));
}

#[tokio::test]
async fn cancel_queued_task_before_start() {
    let orch = build(test_config()).await;
    let recorder = Arc::new(Recorder::default());
    register(&orch, "rec", recorder.clone());
    let id = orch.schedule(TaskRequest::simple("rec", json!({}))).await.unwrap();

    assert!(orch.cancel(id).await.unwrap());
    orch.start().await.unwrap();
    let state = wait(&orch, id).await;
    assert_eq!(state.status, TaskStatus::Cancelled);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.seen.lock().is_empty());
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_delayed_task() {
    let orch = build(test_config()).await;
    let recorder = Arc::new(Recorder::default());
    register(&orch, "rec", recorder.clone());
    orch.start().await.unwrap();
    let id = orch
        .schedule(
            TaskRequest::simple("rec", json!({}))
                .with_options(TaskOptions::default().with_delay(Duration::from_secs(30))),
        )
        .await
        .unwrap();

    assert!(orch.cancel(id).await.unwrap());
    assert_eq!(orch.get_status(id).unwrap().status, TaskStatus::Cancelled);
    assert!(recorder.seen.lock().is_empty());
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn cancel_during_retry_backoff() {
    let mut config = test_config();
    config.queue.retry = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(60));
    let orch = build(config).await;
    let agent = Flaky::new(u32::MAX, boom);
    register(&orch, "flaky", agent.clone());
    let mut stream = orch.subscribe(|_, s| s.metadata.contains_key(RETRY_IN_MS));
    orch.start().await.unwrap();

    let id = orch
        .schedule(TaskRequest::simple("flaky", json!({})).with_options(with_attempts(3)))
        .await
        .unwrap();
    let retrying = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retrying.status, TaskStatus::Running);
    assert_eq!(retrying.metadata[RETRY_IN_MS], json!(30_000));

    assert!(orch.cancel(id).await.unwrap());
    let state = wait(&orch, id).await;
    assert_eq!(state.status, TaskStatus::Cancelled);
    assert_eq!(state.attempts, 1);
    assert_eq!(agent.calls(), 1);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn in_flight_task_is_not_preempted() {
    let orch = build(test_config()).await;
    let gate = Arc::new(Gate::default());
    register(&orch, "gate", gate.clone());
    orch.start().await.unwrap();

    let id = orch.schedule(TaskRequest::simple("gate", json!(7))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), gate.entered.notified())
        .await
        .unwrap();

    assert_eq!(orch.cancel(id).await.unwrap_err(), CancelError::InFlight(id));
    gate.release.notify_one();
    let state = wait(&orch, id).await;
    assert_eq!(state.status, TaskStatus::Completed);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn purge_only_terminal_tasks() {
    let orch = build(test_config()).await;
    register(&orch, "echo", Flaky::new(0, boom));
    let pending = orch.schedule(TaskRequest::simple("echo", json!({}))).await.unwrap();
    assert!(matches!(
        orch.purge(pending).await.unwrap_err(),
        ConductorError::Lifecycle(_)
    ));

    orch.start().await.unwrap();
    wait(&orch, pending).await;
    assert!(orch.purge(pending).await.unwrap());
    assert!(matches!(
        orch.get_status(pending).unwrap_err(),
        ConductorError::TaskNotFound(_)
    ));
    assert!(orch.store().get_task(pending).await.unwrap().is_none());
    orch.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Persistence and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pending_tasks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = Orchestrator::builder(test_config())
        .with_store(Arc::new(FileTaskStore::new(dir.path()).await.unwrap()))
        .build()
        .await
        .unwrap();
    register(&first, "echo", Flaky::new(0, boom));
    let id = first
        .schedule(TaskRequest::simple("echo", json!({"keep": true})))
        .await
        .unwrap();
    first.stop().await.unwrap();

    let second = Orchestrator::builder(test_config())
        .with_store(Arc::new(FileTaskStore::new(dir.path()).await.unwrap()))
        .build()
        .await
        .unwrap();
    register(&second, "echo", Flaky::new(0, boom));
    assert!(matches!(
        second.get_status(id).unwrap_err(),
        ConductorError::TaskNotFound(_)
    ));
    second.start().await.unwrap();

    let state = wait(&second, id).await;
    assert_eq!(state.status, TaskStatus::Completed);
    assert_eq!(state.result, Some(json!({"keep": true})));
    let stored = second.store().get_task(id).await.unwrap().unwrap();
    assert_eq!(stored.state.status, TaskStatus::Completed);
    second.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

#[tokio::test]
async fn metrics_monitor_counts_lifecycle_events() {
    let metrics = Arc::new(MetricsMonitor::new());
    let orch = Orchestrator::builder(test_config())
        .with_store(Arc::new(MemoryTaskStore::new()))
        .with_monitor(metrics.clone())
        .build()
        .await
        .unwrap();
    register(&orch, "flaky", Flaky::new(u32::MAX, boom));
    orch.start().await.unwrap();

    let id = orch
        .schedule(TaskRequest::simple("flaky", json!({})).with_options(with_attempts(3)))
        .await
        .unwrap();
    wait(&orch, id).await;

    // Monitors are notified on background tasks.
    let mut counts = AgentMetrics::default();
    for _ in 0..100 {
        counts = metrics.get("flaky").unwrap_or_default();
        if counts.failed == 1 && counts.started == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(counts.started, 3);
    assert_eq!(counts.retried, 2);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.completed, 0);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn webhook_monitor_failure_does_not_affect_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.monitor.webhook_url = Some(format!("{}/events", server.uri()));
    let orch = build(config).await;
    register(&orch, "echo", Flaky::new(0, boom));
    orch.start().await.unwrap();

    let id = orch.schedule(TaskRequest::simple("echo", json!({}))).await.unwrap();
    let state = wait(&orch, id).await;
    assert_eq!(state.status, TaskStatus::Completed);

    let mut delivered = 0;
    for _ in 0..100 {
        delivered = server.received_requests().await.unwrap().len();
        if delivered >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered >= 2, "expected started and completed events");
    let first: TaskEvent =
        serde_json::from_slice(&server.received_requests().await.unwrap()[0].body).unwrap();
    assert_eq!(first.task_id, id);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn webhook_agent_runs_on_queue_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "sent"})))
        .expect(1)
        .mount(&server)
        .await;

    let orch = build(test_config()).await;
    let config = WebhookAgentConfig {
        id: "notify".into(),
        name: Some("Notifier".into()),
        version: "1.0.0".into(),
        url: format!("{}/flow", server.uri()),
        headers: Default::default(),
        timeout_ms: 5_000,
        capabilities: ["notify".to_string()].into_iter().collect(),
        steps: Vec::new(),
    };
    orch.register_agent(config.descriptor(), Arc::new(WebhookAgent::from_config(&config)))
        .unwrap();
    assert_eq!(orch.discover("notify").len(), 1);
    orch.start().await.unwrap();

    let id = orch
        .schedule(TaskRequest::simple("notify", json!({"to": "dev@example.com"})))
        .await
        .unwrap();
    let state = wait(&orch, id).await;
    assert_eq!(state.result, Some(json!({"status": "sent"})));
    orch.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Recurring schedules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cron_template_fires_and_recurs() {
    let orch = build(test_config()).await;
    let recorder = Arc::new(Recorder::default());
    register(&orch, "rec", recorder.clone());
    orch.start().await.unwrap();

    let template = orch
        .schedule(
            TaskRequest::simple("rec", json!("tick"))
                .with_options(TaskOptions::default().with_cron("* * * * * * *")),
        )
        .await
        .unwrap();
    let mut recurrences = orch.subscribe(move |d, s| {
        d.schedule_id == Some(template) && s.status == TaskStatus::Completed
    });

    assert_eq!(wait(&orch, template).await.status, TaskStatus::Completed);
    let occurrence = tokio::time::timeout(Duration::from_secs(5), recurrences.next())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(occurrence.task_id, template);

    assert!(orch.cancel_schedule(template));
    assert!(!orch.cancel_schedule(template));
    assert!(recorder.seen.lock().len() >= 2);
    orch.stop().await.unwrap();
}

#[tokio::test]
async fn cancelling_pending_template_stops_schedule() {
    let orch = build(test_config()).await;
    let recorder = Arc::new(Recorder::default());
    register(&orch, "rec", recorder.clone());
    orch.start().await.unwrap();

    // Fires once a year; stays PENDING for the duration of the test.
    let template = orch
        .schedule(
            TaskRequest::simple("rec", json!("yearly"))
                .with_options(TaskOptions::default().with_cron("0 0 0 1 1 * *")),
        )
        .await
        .unwrap();
    assert_eq!(orch.get_status(template).unwrap().status, TaskStatus::Pending);

    assert!(orch.cancel(template).await.unwrap());
    assert_eq!(
        orch.get_status(template).unwrap().status,
        TaskStatus::Cancelled
    );
    assert!(!orch.cancel_schedule(template));
    orch.stop().await.unwrap();
}
