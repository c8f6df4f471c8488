use crate::monitor::{notify_monitors, TaskEvent, TaskEventKind, TaskMonitor};
use chrono::Utc;
use conductor_core::{
    AgentError, ConductorError, ConductorResult, ErrorContext, TaskClass, TaskDescriptor, TaskId,
    TaskRecord, TaskState, TaskStatus,
};
use conductor_store::TaskStore;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

/// Metadata key set while a failed attempt waits for its retry.
pub const RETRY_IN_MS: &str = "retry_in_ms";
/// Metadata key holding the message of the error that triggered a retry.
pub const LAST_ERROR: &str = "last_error";

/// Stream of state updates returned by [`StatusRegistry::subscribe`].
pub type TaskStream = UnboundedReceiverStream<TaskState>;

/// A status update submitted by an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    status: TaskStatus,
    attempt: Option<u32>,
    result: Option<Value>,
    error: Option<ErrorContext>,
    metadata: HashMap<String, Value>,
    retrying: bool,
}

impl Report {
    fn new(status: TaskStatus) -> Self {
        Self {
            status,
            attempt: None,
            result: None,
            error: None,
            metadata: HashMap::new(),
            retrying: false,
        }
    }

    /// Attempt `attempt` is starting.
    pub fn running(attempt: u32) -> Self {
        Self {
            attempt: Some(attempt),
            ..Self::new(TaskStatus::Running)
        }
    }

    /// Attempt `attempt` failed and the task will run again after `delay`.
    pub fn retrying(attempt: u32, delay: Duration, error: &AgentError) -> Self {
        Self {
            attempt: Some(attempt),
            retrying: true,
            ..Self::new(TaskStatus::Running)
        }
        .with_metadata(RETRY_IN_MS, u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
        .with_metadata(LAST_ERROR, error.to_string())
    }

    /// Still running; only metadata changes.
    pub fn progress() -> Self {
        Self::new(TaskStatus::Running)
    }

    /// Finished with `output`.
    pub fn completed(output: Value) -> Self {
        Self {
            result: Some(output),
            ..Self::new(TaskStatus::Completed)
        }
    }

    /// Gave up with `error`.
    pub fn failed(error: ErrorContext) -> Self {
        Self {
            error: Some(error),
            ..Self::new(TaskStatus::Failed)
        }
    }

    /// Cancelled.
    pub fn cancelled() -> Self {
        Self::new(TaskStatus::Cancelled)
    }

    /// Merge a metadata entry into the state.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Status the report moves the task to.
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    fn apply(self, mut state: TaskState) -> TaskState {
        let now = Utc::now();
        if self.status == TaskStatus::Running && state.started_at.is_none() {
            state.started_at = Some(now);
        }
        if self.status == TaskStatus::Running && !self.retrying && self.attempt.is_some() {
            state.metadata.remove(RETRY_IN_MS);
        }
        state.status = self.status;
        if let Some(attempt) = self.attempt {
            state.attempts = attempt;
        }
        if self.result.is_some() {
            state.result = self.result;
        }
        if self.error.is_some() {
            state.error = self.error;
        }
        state.metadata.extend(self.metadata);
        state.last_updated_at = now;
        state
    }

    fn event_kind(&self) -> Option<TaskEventKind> {
        match self.status {
            TaskStatus::Running if self.retrying => Some(TaskEventKind::Retrying),
            TaskStatus::Running if self.attempt.is_some() => Some(TaskEventKind::Started),
            TaskStatus::Completed => Some(TaskEventKind::Completed),
            TaskStatus::Failed => Some(TaskEventKind::Failed),
            TaskStatus::Cancelled => Some(TaskEventKind::Cancelled),
            _ => None,
        }
    }
}

/// Which tasks `list` returns. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Only tasks for this agent.
    pub agent_id: Option<String>,
    /// Only tasks of this class.
    pub task_class: Option<TaskClass>,
}

impl TaskFilter {
    /// Filter by status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by agent.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Filter by class.
    pub fn with_class(mut self, class: TaskClass) -> Self {
        self.task_class = Some(class);
        self
    }

    /// Whether a task passes every set field.
    pub fn matches(&self, descriptor: &TaskDescriptor, state: &TaskState) -> bool {
        self.status.map_or(true, |s| s == state.status)
            && self
                .agent_id
                .as_deref()
                .map_or(true, |a| a == descriptor.agent_id)
            && self.task_class.map_or(true, |c| c == descriptor.task_class)
    }
}

type Predicate = Box<dyn Fn(&TaskDescriptor, &TaskState) -> bool + Send + Sync>;

struct Subscriber {
    predicate: Predicate,
    tx: mpsc::UnboundedSender<TaskState>,
}

struct Slot {
    descriptor: TaskDescriptor,
    // Held across validate, persist and publish so reports on one task apply in order.
    write_gate: tokio::sync::Mutex<()>,
    state: watch::Sender<TaskState>,
}

impl Slot {
    fn new(descriptor: TaskDescriptor, state: TaskState) -> Arc<Self> {
        let (tx, _) = watch::channel(state);
        Arc::new(Self {
            descriptor,
            write_gate: tokio::sync::Mutex::new(()),
            state: tx,
        })
    }

    fn current(&self) -> TaskState {
        self.state.borrow().clone()
    }
}

/// Single source of truth for task status.
///
/// Executors report transitions; callers read, list, wait and subscribe.
/// Every accepted report is persisted to the task store, published to
/// matching subscribers, and turned into a monitor event.
pub struct StatusRegistry {
    slots: RwLock<HashMap<TaskId, Arc<Slot>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    store: Arc<dyn TaskStore>,
    monitors: Vec<Arc<dyn TaskMonitor>>,
}

impl StatusRegistry {
    /// An empty registry persisting to `store`.
    pub fn new(store: Arc<dyn TaskStore>, monitors: Vec<Arc<dyn TaskMonitor>>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            store,
            monitors,
        }
    }

    fn slot(&self, task_id: TaskId) -> Option<Arc<Slot>> {
        self.slots.read().get(&task_id).cloned()
    }

    /// Accept a new task in PENDING. The record is persisted before it
    /// becomes visible; a store failure leaves no state behind.
    pub async fn create(&self, descriptor: TaskDescriptor) -> ConductorResult<TaskState> {
        let task_id = descriptor.task_id;
        let state = TaskState::pending(task_id);
        self.store
            .insert_task(&TaskRecord {
                descriptor: descriptor.clone(),
                state: state.clone(),
            })
            .await?;

        let slot = Slot::new(descriptor, state.clone());
        let _gate = slot.write_gate.lock().await;
        self.slots.write().insert(task_id, slot.clone());
        self.publish(&slot.descriptor, &state);
        Ok(state)
    }

    /// Load a persisted record without writing it back. Returns `false`
    /// when the task is already known.
    pub fn restore(&self, record: TaskRecord) -> bool {
        let mut slots = self.slots.write();
        if slots.contains_key(&record.descriptor.task_id) {
            return false;
        }
        let task_id = record.descriptor.task_id;
        slots.insert(task_id, Slot::new(record.descriptor, record.state));
        true
    }

    /// Apply a status report from the owning executor.
    pub async fn report(&self, task_id: TaskId, report: Report) -> ConductorResult<TaskState> {
        let slot = self
            .slot(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))?;
        let _gate = slot.write_gate.lock().await;

        let current = slot.current();
        if !current.status.can_transition_to(report.status) {
            return Err(ConductorError::InvalidTransition {
                task_id,
                from: current.status,
                to: report.status,
            });
        }

        let kind = report.event_kind();
        let next = report.apply(current);
        slot.state.send_replace(next.clone());
        debug!(task_id = %task_id, status = %next.status, attempts = next.attempts, "Status updated");

        if let Err(e) = self.store.update_state(&next).await {
            warn!(task_id = %task_id, error = %e, "Failed to persist task state");
        }
        self.publish(&slot.descriptor, &next);

        if let Some(kind) = kind {
            notify_monitors(&self.monitors, event_for(&slot.descriptor, &next, kind));
        }
        Ok(next)
    }

    /// Current state of a task.
    pub fn get(&self, task_id: TaskId) -> Option<TaskState> {
        self.slot(task_id).map(|s| s.current())
    }

    /// Descriptor of a task.
    pub fn descriptor(&self, task_id: TaskId) -> Option<TaskDescriptor> {
        self.slot(task_id).map(|s| s.descriptor.clone())
    }

    /// Descriptor and state together.
    pub fn record(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.slot(task_id).map(|s| TaskRecord {
            descriptor: s.descriptor.clone(),
            state: s.current(),
        })
    }

    /// Tasks matching `filter`, oldest submission first.
    pub fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self
            .slots
            .read()
            .values()
            .map(|s| TaskRecord {
                descriptor: s.descriptor.clone(),
                state: s.current(),
            })
            .filter(|r| filter.matches(&r.descriptor, &r.state))
            .collect();
        records.sort_by(|a, b| {
            a.descriptor
                .submitted_at
                .cmp(&b.descriptor.submitted_at)
                .then_with(|| a.descriptor.task_id.cmp(&b.descriptor.task_id))
        });
        records
    }

    /// Number of known tasks.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether no task is known.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Future state updates of tasks accepted by `predicate`, in report
    /// order per task. Dropping the stream unsubscribes.
    pub fn subscribe<F>(&self, predicate: F) -> TaskStream
    where
        F: Fn(&TaskDescriptor, &TaskState) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            predicate: Box::new(predicate),
            tx,
        });
        UnboundedReceiverStream::new(rx)
    }

    fn publish(&self, descriptor: &TaskDescriptor, state: &TaskState) {
        self.subscribers.lock().retain(|sub| {
            if !(sub.predicate)(descriptor, state) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(state.clone()).is_ok()
        });
    }

    /// Resolve once the task reaches a terminal status.
    pub async fn wait(&self, task_id: TaskId) -> ConductorResult<TaskState> {
        let slot = self
            .slot(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))?;
        let mut rx = slot.state.subscribe();
        let state = rx
            .wait_for(TaskState::is_terminal)
            .await
            .map_err(|_| ConductorError::Lifecycle(format!("task {task_id} was dropped")))?
            .clone();
        Ok(state)
    }

    /// Forget a terminal task, here and in the store.
    pub async fn purge(&self, task_id: TaskId) -> ConductorResult<bool> {
        let slot = self
            .slot(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))?;
        let _gate = slot.write_gate.lock().await;
        let status = slot.state.borrow().status;
        if !status.is_terminal() {
            return Err(ConductorError::Lifecycle(format!(
                "task {task_id} is {status}; only terminal tasks can be purged"
            )));
        }
        // Store first: a failed delete leaves the task visible here too.
        let removed = self.store.delete_task(task_id).await?;
        if slot.descriptor.task_class == TaskClass::Complex {
            self.store
                .delete_execution(&slot.descriptor.workflow_id())
                .await?;
        }
        self.slots.write().remove(&task_id);
        Ok(removed)
    }
}

fn event_for(descriptor: &TaskDescriptor, state: &TaskState, kind: TaskEventKind) -> TaskEvent {
    let detail = match kind {
        TaskEventKind::Failed => state.error.as_ref().map(|e| Value::String(e.message.clone())),
        TaskEventKind::Retrying => state.metadata.get(LAST_ERROR).cloned(),
        TaskEventKind::Completed => state.result.clone(),
        _ => None,
    };
    TaskEvent {
        task_id: descriptor.task_id,
        agent_id: descriptor.agent_id.clone(),
        task_class: descriptor.task_class,
        kind,
        attempt: state.attempts,
        at: state.last_updated_at,
        detail,
    }
}
