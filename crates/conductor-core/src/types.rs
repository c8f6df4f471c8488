use crate::error::{AgentError, AgentErrorKind, ConductorError, ConductorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Identifier of a submitted task. Generated at submission, never reused.
pub type TaskId = Uuid;

/// Declared nature of a task; decides which executor runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskClass {
    /// Short-lived, retryable work for the queue executor.
    Simple,
    /// Long-running, multi-step, checkpointed work for the workflow executor.
    Complex,
}

impl std::fmt::Display for TaskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskClass::Simple => write!(f, "SIMPLE"),
            TaskClass::Complex => write!(f, "COMPLEX"),
        }
    }
}

impl FromStr for TaskClass {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("simple") {
            Ok(TaskClass::Simple)
        } else if trimmed.eq_ignore_ascii_case("complex") {
            Ok(TaskClass::Complex)
        } else {
            Err(ConductorError::Classification(format!(
                "unrecognized task class '{s}' (expected SIMPLE or COMPLEX)"
            )))
        }
    }
}

/// Lifecycle status of a task, shared by both executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Accepted, waiting to run.
    Pending,
    /// Dispatched to an executor.
    Running,
    /// Finished successfully.
    Completed,
    /// Gave up; the state carries an error context.
    Failed,
    /// Cancelled before it finished.
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed and cancelled tasks never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a report may move a task from `self` to `next`.
    ///
    /// Progression is monotonic: PENDING → RUNNING → terminal. RUNNING may be
    /// re-reported to carry attempt and progress updates. PENDING may jump
    /// straight to FAILED or CANCELLED when a task never gets to run.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(
                next,
                TaskStatus::Running | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Running
                    | TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Cancelled
            ),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            other => Err(ConductorError::Config(format!("unknown task status '{other}'"))),
        }
    }
}

/// Execution options attached to a task.
///
/// Unset values are resolved against the orchestrator configuration when the
/// task is accepted, so a stored descriptor is self-describing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Higher values are dequeued first.
    #[serde(default)]
    pub priority: i32,
    /// Attempts allowed for a SIMPLE task.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Per-attempt timeout (SIMPLE) or whole-workflow timeout (COMPLEX).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Workflow task queue name; only meaningful for COMPLEX tasks.
    #[serde(default)]
    pub task_queue_name: Option<String>,
    /// Recurring schedule in 7-field cron syntax.
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Initial delay before a SIMPLE task becomes eligible for dequeue.
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl TaskOptions {
    /// Set the dequeue priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attempt limit.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the attempt or workflow timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// Route a COMPLEX task to a named task queue.
    pub fn with_task_queue(mut self, name: impl Into<String>) -> Self {
        self.task_queue_name = Some(name.into());
        self
    }

    /// Make the task recurring.
    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self
    }

    /// Hold the first attempt back by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(duration_ms(delay));
        self
    }

    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Initial delay; zero counts as none.
    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Untyped submission, as received from callers or read from JSON.
///
/// The task class is still a string here; turning a request into a
/// [`TaskDescriptor`] is where an unrecognized class gets rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Target agent id.
    pub agent_id: String,
    /// `SIMPLE` or `COMPLEX`, case-insensitive.
    pub task_class: String,
    /// Opaque agent input.
    #[serde(default)]
    pub payload: Value,
    /// Execution options.
    #[serde(default)]
    pub options: TaskOptions,
}

impl TaskRequest {
    /// A request with default options.
    pub fn new(agent_id: impl Into<String>, task_class: impl Into<String>, payload: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_class: task_class.into(),
            payload,
            options: TaskOptions::default(),
        }
    }

    /// A SIMPLE request for the given agent.
    pub fn simple(agent_id: impl Into<String>, payload: Value) -> Self {
        Self::new(agent_id, TaskClass::Simple.to_string(), payload)
    }

    /// A COMPLEX request for the given agent.
    pub fn complex(agent_id: impl Into<String>, payload: Value) -> Self {
        Self::new(agent_id, TaskClass::Complex.to_string(), payload)
    }

    /// Replace the options.
    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }
}

/// Immutable description of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Assigned on acceptance, unique per submission.
    pub task_id: TaskId,
    /// Target agent id.
    pub agent_id: String,
    /// Executor the task is routed to.
    pub task_class: TaskClass,
    /// Opaque agent input.
    pub payload: Value,
    /// Options with defaults already applied.
    pub options: TaskOptions,
    /// Acceptance time.
    pub submitted_at: DateTime<Utc>,
    /// Set on occurrences fired by a recurring schedule; names the schedule.
    #[serde(default)]
    pub schedule_id: Option<TaskId>,
}

impl TaskDescriptor {
    /// Describe a new task with a fresh id.
    pub fn new(
        agent_id: impl Into<String>,
        task_class: TaskClass,
        payload: Value,
        options: TaskOptions,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            task_class,
            payload,
            options,
            submitted_at: Utc::now(),
            schedule_id: None,
        }
    }

    /// Classify a request. Fails with [`ConductorError::Classification`] on an
    /// unrecognized class.
    pub fn from_request(request: TaskRequest) -> ConductorResult<Self> {
        let class: TaskClass = request.task_class.parse()?;
        Ok(Self::new(
            request.agent_id,
            class,
            request.payload,
            request.options,
        ))
    }

    /// The next occurrence of a recurring task: same work, fresh identity.
    pub fn recur(&self) -> Self {
        let mut options = self.options.clone();
        options.cron_expression = None;
        Self {
            task_id: Uuid::new_v4(),
            agent_id: self.agent_id.clone(),
            task_class: self.task_class,
            payload: self.payload.clone(),
            options,
            submitted_at: Utc::now(),
            schedule_id: Some(self.schedule_id.unwrap_or(self.task_id)),
        }
    }

    /// Effective attempt bound; never less than one.
    pub fn max_attempts(&self) -> u32 {
        self.options.max_attempts.unwrap_or(1).max(1)
    }

    /// Workflow id of a COMPLEX task: `<task queue>/<task id>`.
    pub fn workflow_id(&self) -> String {
        let queue = self.options.task_queue_name.as_deref().unwrap_or("default");
        format!("{queue}/{}", self.task_id)
    }
}

/// Structured failure attached to a FAILED task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Message of the last error.
    pub message: String,
    /// Which part of the agent contract failed.
    pub kind: AgentErrorKind,
    /// Attempt number (SIMPLE) or step attempt (COMPLEX) that failed.
    pub attempt: u32,
    /// Failed workflow step name.
    #[serde(default)]
    pub step: Option<String>,
    /// Failed workflow step index.
    #[serde(default)]
    pub step_index: Option<usize>,
    /// Snapshot of the input the failing attempt saw.
    #[serde(default)]
    pub payload: Option<Value>,
}

impl ErrorContext {
    /// Capture an agent error raised on `attempt`.
    pub fn from_agent_error(error: &AgentError, attempt: u32) -> Self {
        Self {
            message: error.message.clone(),
            kind: error.kind,
            attempt,
            step: None,
            step_index: None,
            payload: None,
        }
    }

    /// Record the workflow step that failed.
    pub fn with_step(mut self, index: usize, name: impl Into<String>) -> Self {
        self.step_index = Some(index);
        self.step = Some(name.into());
        self
    }

    /// Attach the input of the failed attempt.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Mutable execution state of a task, mirrored by the status registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Task this state belongs to.
    pub task_id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Attempts (SIMPLE) or driver runs (COMPLEX) so far.
    pub attempts: u32,
    /// First time the task was reported RUNNING.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Time of the latest report.
    pub last_updated_at: DateTime<Utc>,
    /// Output of a COMPLETED task.
    #[serde(default)]
    pub result: Option<Value>,
    /// Last error of a FAILED task.
    #[serde(default)]
    pub error: Option<ErrorContext>,
    /// Executor-specific progress, e.g. retry delay or current step.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl TaskState {
    /// The state every accepted task starts in.
    pub fn pending(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            last_updated_at: Utc::now(),
            result: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A descriptor together with its current state, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// What was submitted.
    pub descriptor: TaskDescriptor,
    /// Where it stands.
    pub state: TaskState,
}

/// Lifecycle of a durable workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Record created, no step run yet.
    Started,
    /// A driver is running steps.
    Running,
    /// Every step checkpointed.
    Completed,
    /// A step failure ended the workflow.
    Failed,
    /// Stopped at a checkpoint boundary.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the workflow can no longer make progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Checkpointed progress of a COMPLEX task.
///
/// `checkpoint_data` maps each completed step name to its output; together
/// with `current_step` it is everything a restarted executor needs to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Owning COMPLEX task.
    pub task_id: TaskId,
    /// `<task queue>/<task id>`.
    pub workflow_id: String,
    /// Index of the first step that has not been checkpointed yet.
    pub current_step: usize,
    /// Step name to output, for every checkpointed step.
    #[serde(default)]
    pub checkpoint_data: Map<String, Value>,
    /// Workflow lifecycle status.
    pub status: WorkflowStatus,
    /// First start; workflow timeouts are measured from here.
    pub started_at: DateTime<Utc>,
    /// Time of the latest checkpoint or status change.
    pub updated_at: DateTime<Utc>,
    /// How many times a driver picked this workflow up (start plus resumes).
    #[serde(default)]
    pub runs: u32,
}

impl ExecutionRecord {
    /// A fresh record positioned at the first step.
    pub fn new(task_id: TaskId, workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            workflow_id: workflow_id.into(),
            current_step: 0,
            checkpoint_data: Map::new(),
            status: WorkflowStatus::Started,
            started_at: now,
            updated_at: now,
            runs: 0,
        }
    }

    /// Record a finished step and advance past it.
    pub fn checkpoint(&mut self, step_name: &str, output: Value) {
        self.checkpoint_data.insert(step_name.to_string(), output);
        self.current_step += 1;
        self.updated_at = Utc::now();
    }

    /// Change the status and bump `updated_at`.
    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_class_parsing() {
        assert_eq!("SIMPLE".parse::<TaskClass>().unwrap(), TaskClass::Simple);
        assert_eq!(" complex ".parse::<TaskClass>().unwrap(), TaskClass::Complex);
        let err = "BATCH".parse::<TaskClass>().unwrap_err();
        assert!(matches!(err, ConductorError::Classification(_)));
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_descriptor_from_request() {
        let request = TaskRequest::simple("php-analyzer", json!({"file": "index.php"}))
            .with_options(TaskOptions::default().with_priority(5));
        let descriptor = TaskDescriptor::from_request(request).unwrap();
        assert_eq!(descriptor.task_class, TaskClass::Simple);
        assert_eq!(descriptor.options.priority, 5);
        assert_eq!(descriptor.agent_id, "php-analyzer");
    }

    #[test]
    fn test_identical_requests_get_distinct_ids() {
        let a = TaskDescriptor::from_request(TaskRequest::simple("a", json!(1))).unwrap();
        let b = TaskDescriptor::from_request(TaskRequest::simple("a", json!(1))).unwrap();
        assert_ne!(a.task_id, b.task_id);
    }

    #[test]
    fn test_unknown_class_rejected() {
        let request = TaskRequest::new("a", "webhook", json!({}));
        assert!(TaskDescriptor::from_request(request).is_err());
    }

    #[test]
    fn test_recur_keeps_schedule_identity() {
        let first = TaskDescriptor::new(
            "reporter",
            TaskClass::Simple,
            json!({}),
            TaskOptions::default().with_cron("0 0 * * * * *"),
        );
        let second = first.recur();
        let third = second.recur();
        assert_ne!(second.task_id, first.task_id);
        assert_eq!(second.schedule_id, Some(first.task_id));
        assert_eq!(third.schedule_id, Some(first.task_id));
        assert!(second.options.cron_expression.is_none());
    }

    #[test]
    fn test_workflow_id_uses_task_queue() {
        let d = TaskDescriptor::new(
            "migrator",
            TaskClass::Complex,
            json!({}),
            TaskOptions::default().with_task_queue("migrations"),
        );
        assert_eq!(d.workflow_id(), format!("migrations/{}", d.task_id));
    }

    #[test]
    fn test_execution_record_checkpoint() {
        let mut record = ExecutionRecord::new(Uuid::new_v4(), "default/x");
        record.checkpoint("analyze", json!({"files": 3}));
        record.checkpoint("generate", json!("ok"));
        assert_eq!(record.current_step, 2);
        assert_eq!(record.checkpoint_data["analyze"]["files"], 3);
    }

    #[test]
    fn test_task_state_serialization() {
        let mut state = TaskState::pending(Uuid::new_v4());
        state.status = TaskStatus::Failed;
        state.error = Some(
            ErrorContext::from_agent_error(&AgentError::exec("boom"), 3).with_step(1, "generate"),
        );
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"FAILED\""));
        let parsed: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_max_attempts_floor() {
        let mut d = TaskDescriptor::new("a", TaskClass::Simple, json!(null), TaskOptions::default());
        assert_eq!(d.max_attempts(), 1);
        d.options.max_attempts = Some(0);
        assert_eq!(d.max_attempts(), 1);
        d.options.max_attempts = Some(4);
        assert_eq!(d.max_attempts(), 4);
    }
}
