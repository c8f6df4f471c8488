use crate::types::TaskStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Which part of the agent contract produced an [`AgentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// `initialize` failed.
    Init,
    /// `execute` failed.
    Exec,
    /// `validate` failed or rejected the input.
    Validation,
    /// `stop` failed.
    Shutdown,
    /// The executor gave up waiting on `execute`. Never raised by agents.
    Timeout,
    /// The executor could not reach the target agent (e.g. it was unregistered).
    Dispatch,
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentErrorKind::Init => write!(f, "init"),
            AgentErrorKind::Exec => write!(f, "exec"),
            AgentErrorKind::Validation => write!(f, "validation"),
            AgentErrorKind::Shutdown => write!(f, "shutdown"),
            AgentErrorKind::Timeout => write!(f, "timeout"),
            AgentErrorKind::Dispatch => write!(f, "dispatch"),
        }
    }
}

/// A failure reported through the agent contract.
///
/// `retryable` is the agent's own verdict: a non-retryable error makes the
/// queue executor skip the remaining attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct AgentError {
    /// Which part of the contract failed.
    pub kind: AgentErrorKind,
    /// Human-readable cause.
    pub message: String,
    /// Whether the executor may try again.
    pub retryable: bool,
}

impl AgentError {
    fn new(kind: AgentErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Initialization failure. Retryable: the next attempt re-runs `initialize`.
    pub fn init(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Init, message, true)
    }

    /// Execution failure. Retryable unless marked otherwise.
    pub fn exec(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Exec, message, true)
    }

    /// Validation failure. Never retryable: the input will not change.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Validation, message, false)
    }

    /// Shutdown failure.
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Shutdown, message, false)
    }

    /// Raised by an executor when an attempt or step exceeds its deadline.
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            AgentErrorKind::Timeout,
            format!("execution timed out after {}ms", after.as_millis()),
            true,
        )
    }

    /// Raised by an executor when the target agent cannot be resolved.
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Dispatch, message, false)
    }

    /// Flag this error as permanent.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Whether the executor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Why a cancellation request could not be honored.
///
/// Cancelling a task that already reached a terminal status is not an error;
/// it is reported as `Ok(false)` by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    /// No task with this id is known.
    #[error("task {0} not found")]
    NotFound(Uuid),

    /// The task is running on a worker right now.
    #[error("task {0} is already executing and cannot be preempted")]
    InFlight(Uuid),
}

/// Top-level error type for the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// The submitted task class is neither SIMPLE nor COMPLEX.
    #[error("Classification error: {0}")]
    Classification(String),

    /// The descriptor targets an agent id nobody registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// An agent with the same id is already registered.
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    /// No task state exists for the given id.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// A status report would move a task backwards or out of a terminal state.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A workflow with this id already has an in-flight execution.
    #[error("Workflow already running: {0}")]
    WorkflowAlreadyRunning(String),

    /// The cron expression attached to a descriptor does not parse.
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    /// A cancellation request was rejected.
    #[error("Cancel error: {0}")]
    Cancel(#[from] CancelError),

    /// An agent-contract failure surfaced outside an executor (registration, stop).
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// The task store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration could not be read or parsed.
    #[error("Config error: {0}")]
    Config(String),

    /// A monitoring sink failed to accept an event.
    #[error("Monitor error: {0}")]
    Monitor(String),

    /// An operation was attempted in the wrong lifecycle phase.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;
