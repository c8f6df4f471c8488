use crate::config::QueueConfig;
use crate::rate_limit::RateLimiter;
use crate::registry::{Report, StatusRegistry};
use conductor_agent::{AgentInput, AgentRegistry};
use conductor_core::{AgentError, CancelError, ConductorError, ErrorContext, TaskDescriptor, TaskId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One entry of the priority queue.
struct QueuedTask {
    priority: i32,
    seq: u64,
    attempt: u32,
    descriptor: Arc<TaskDescriptor>,
}

impl QueuedTask {
    fn task_id(&self) -> TaskId {
        self.descriptor.task_id
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then lower sequence (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Where every SIMPLE task owned by the executor currently sits.
#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<QueuedTask>,
    delayed: HashMap<TaskId, JoinHandle<()>>,
    in_flight: HashSet<TaskId>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    seq: AtomicU64,
    registry: Arc<StatusRegistry>,
    agents: Arc<AgentRegistry>,
    limiter: RateLimiter,
    config: QueueConfig,
}

/// Executes SIMPLE tasks on a fixed pool of workers.
///
/// Tasks are dequeued by priority, FIFO within equal priority. Each dequeue
/// consumes a token from the global rate limiter. A failed attempt is
/// re-enqueued after exponential backoff until the task's attempt budget is
/// spent or the agent reports a non-retryable error.
pub struct QueueExecutor {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueExecutor {
    /// Build an idle executor; call [`QueueExecutor::start`] to run workers.
    pub fn new(
        config: QueueConfig,
        registry: Arc<StatusRegistry>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limit.tokens,
            Duration::from_millis(config.rate_limit.refill_interval_ms),
        );
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                seq: AtomicU64::new(0),
                registry,
                agents,
                limiter,
                config,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Tasks submitted earlier are already queued.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        let count = self.inner.config.concurrency.max(1);
        for worker_id in 0..count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move { inner.worker_loop(worker_id).await }));
        }
        info!(workers = count, "Queue executor started");
    }

    /// Accept a task for its first attempt, honoring its initial delay.
    pub fn submit(&self, descriptor: TaskDescriptor) {
        self.resubmit(descriptor, 1);
    }

    /// Enqueue a task at a given attempt number. Used by recovery.
    pub fn resubmit(&self, descriptor: TaskDescriptor, attempt: u32) {
        let delay = if attempt == 1 {
            descriptor.options.delay()
        } else {
            None
        };
        let item = self.inner.item(Arc::new(descriptor), attempt);
        match delay {
            Some(delay) => self.inner.push_delayed(item, delay),
            None => self.inner.push_ready(item),
        }
    }

    /// Cancel a task that is queued, delayed, or waiting for a retry.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, CancelError> {
        let state = self
            .inner
            .registry
            .get(task_id)
            .ok_or(CancelError::NotFound(task_id))?;
        if state.is_terminal() {
            return Ok(false);
        }

        {
            let mut queue = self.inner.state.lock();
            if queue.in_flight.contains(&task_id) {
                return Err(CancelError::InFlight(task_id));
            }
            queue.ready.retain(|item| item.task_id() != task_id);
            if let Some(handle) = queue.delayed.remove(&task_id) {
                handle.abort();
            }
        }

        match self.inner.registry.report(task_id, Report::cancelled()).await {
            Ok(_) => {
                info!(task_id = %task_id, "Cancelled queued task");
                Ok(true)
            }
            Err(ConductorError::InvalidTransition { .. }) => Ok(false),
            Err(_) => Err(CancelError::NotFound(task_id)),
        }
    }

    /// Tasks waiting for a worker.
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Tasks waiting for an initial delay or a retry backoff.
    pub fn delayed_len(&self) -> usize {
        self.inner.state.lock().delayed.len()
    }

    /// Tasks currently on a worker.
    pub fn in_flight_len(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Abort workers and pending timers. Interrupted tasks keep their
    /// persisted state and are picked up again by recovery.
    pub async fn shutdown(&self) {
        let mut handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        {
            let mut queue = self.inner.state.lock();
            handles.extend(queue.delayed.drain().map(|(_, handle)| handle));
            queue.ready.clear();
            queue.in_flight.clear();
        }
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("Queue executor stopped");
    }
}

impl QueueInner {
    fn item(&self, descriptor: Arc<TaskDescriptor>, attempt: u32) -> QueuedTask {
        QueuedTask {
            priority: descriptor.options.priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
            attempt,
            descriptor,
        }
    }

    fn push_ready(&self, item: QueuedTask) {
        debug!(task_id = %item.task_id(), priority = item.priority, attempt = item.attempt, "Enqueued");
        self.state.lock().ready.push(item);
        self.notify.notify_one();
    }

    /// Park a task behind a timer. Also releases it from `in_flight`, so a
    /// retried task moves from in flight to delayed under one lock.
    fn push_delayed(self: &Arc<Self>, item: QueuedTask, delay: Duration) {
        let task_id = item.task_id();
        let inner = Arc::clone(self);
        let mut queue = self.state.lock();
        queue.in_flight.remove(&task_id);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.promote(item);
        });
        queue.delayed.insert(task_id, timer);
    }

    fn promote(&self, item: QueuedTask) {
        let mut queue = self.state.lock();
        if queue.delayed.remove(&item.task_id()).is_some() {
            queue.ready.push(item);
            drop(queue);
            self.notify.notify_one();
        }
    }

    /// Wait for a ready task, then take a rate-limit token and dequeue it.
    ///
    /// Tokens are only taken once work is visible, so idle workers never
    /// sit on tokens from earlier intervals. A token is handed back when
    /// another worker dequeued the task first.
    async fn next(&self) -> QueuedTask {
        loop {
            let notified = self.notify.notified();
            if self.state.lock().ready.is_empty() {
                notified.await;
                continue;
            }
            self.limiter.acquire().await;
            let popped = {
                let mut queue = self.state.lock();
                let item = queue.ready.pop();
                if let Some(item) = &item {
                    queue.in_flight.insert(item.task_id());
                }
                item
            };
            match popped {
                Some(item) => {
                    if !self.state.lock().ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return item;
                }
                None => self.limiter.release().await,
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker = worker_id, "Queue worker started");
        loop {
            let item = self.next().await;
            self.process(item).await;
        }
    }

    async fn process(self: &Arc<Self>, item: QueuedTask) {
        let descriptor = Arc::clone(&item.descriptor);
        let task_id = descriptor.task_id;
        let attempt = item.attempt;

        if let Err(e) = self.registry.report(task_id, Report::running(attempt)).await {
            warn!(task_id = %task_id, error = %e, "Dropping dequeued task");
            self.state.lock().in_flight.remove(&task_id);
            return;
        }

        let outcome = self.run_attempt(&descriptor, attempt).await;
        let max_attempts = descriptor.max_attempts();

        match outcome {
            Ok(output) => {
                self.finish(task_id, Report::completed(output)).await;
                info!(task_id = %task_id, attempt, "Task completed");
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = self.config.retry.delay_for(attempt);
                warn!(
                    task_id = %task_id,
                    attempt,
                    max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                if let Err(report_err) = self
                    .registry
                    .report(task_id, Report::retrying(attempt, delay, &e))
                    .await
                {
                    error!(task_id = %task_id, error = %report_err, "Failed to record retry");
                }
                let next = self.item(descriptor, attempt + 1);
                self.push_delayed(next, delay);
            }
            Err(e) => {
                warn!(task_id = %task_id, attempt, error = %e, "Task failed");
                let context = ErrorContext::from_agent_error(&e, attempt)
                    .with_payload(descriptor.payload.clone());
                self.finish(task_id, Report::failed(context)).await;
            }
        }
    }

    async fn run_attempt(
        &self,
        descriptor: &TaskDescriptor,
        attempt: u32,
    ) -> Result<serde_json::Value, AgentError> {
        let handle = self.agents.get(&descriptor.agent_id).ok_or_else(|| {
            AgentError::dispatch(format!("agent '{}' is not registered", descriptor.agent_id))
        })?;
        let timeout = descriptor
            .options
            .timeout()
            .unwrap_or_else(|| self.config.default_timeout());
        let input = AgentInput::new(descriptor.task_id, attempt, descriptor.payload.clone());
        handle.run_with_timeout(input, timeout).await
    }

    async fn finish(&self, task_id: TaskId, report: Report) {
        if let Err(e) = self.registry.report(task_id, report).await {
            error!(task_id = %task_id, error = %e, "Failed to record task outcome");
        }
        self.state.lock().in_flight.remove(&task_id);
    }
}
