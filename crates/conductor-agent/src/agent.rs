use async_trait::async_trait;
use conductor_core::{AgentError, StepRetry, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;

/// Capability advertised by agents that tolerate concurrent `execute` calls.
/// Without it, executions against one instance are serialized.
pub const REENTRANT_CAPABILITY: &str = "reentrant";

/// Name of the single step an agent runs when it declares no workflow.
pub const DEFAULT_STEP: &str = "execute";

/// Identity and capabilities of a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique registry key.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Agent version, logged on initialization.
    pub version: String,
    /// Free-form tags used by discovery.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl AgentDescriptor {
    /// Create a descriptor with no capabilities.
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            capabilities: BTreeSet::new(),
        }
    }

    /// Add a capability tag.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Whether the agent advertises `capability`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Reentrant agents may run several executions at once.
    pub fn is_reentrant(&self) -> bool {
        self.has_capability(REENTRANT_CAPABILITY)
    }
}

/// Coarse lifecycle state an agent reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Registered, not yet initialized.
    Created,
    /// Initialized and idle.
    Ready,
    /// Executing.
    Busy,
    /// Stopped; accepts no more work.
    Stopped,
    /// Unusable after an unrecoverable error.
    Failed,
}

/// Snapshot returned by [`Agent::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Current lifecycle state.
    pub state: AgentState,
    /// Agent-specific detail, `null` when absent.
    #[serde(default)]
    pub details: Value,
}

impl AgentStatus {
    /// A status without details.
    pub fn new(state: AgentState) -> Self {
        Self {
            state,
            details: Value::Null,
        }
    }

    /// Attach agent-specific detail.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Position of an execution inside a COMPLEX workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    /// Zero-based step position.
    pub index: usize,
    /// Step name, as declared by the agent.
    pub name: String,
    /// Outputs of every step completed so far, keyed by step name.
    pub checkpoint: Map<String, Value>,
}

/// Everything an agent sees when asked to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    /// Task being executed.
    pub task_id: TaskId,
    /// 1-based attempt number (task attempt for SIMPLE, step attempt for COMPLEX).
    pub attempt: u32,
    /// Payload submitted with the task.
    pub payload: Value,
    /// `None` for SIMPLE tasks.
    #[serde(default)]
    pub step: Option<StepContext>,
}

impl AgentInput {
    /// Input for a plain (non-workflow) execution.
    pub fn new(task_id: TaskId, attempt: u32, payload: Value) -> Self {
        Self {
            task_id,
            attempt,
            payload,
            step: None,
        }
    }

    /// Mark the input as one step of a workflow.
    pub fn with_step(mut self, step: StepContext) -> Self {
        self.step = Some(step);
        self
    }

    /// Name of the workflow step, if any.
    pub fn step_name(&self) -> Option<&str> {
        self.step.as_ref().map(|s| s.name.as_str())
    }
}

/// One named, checkpointed step of a COMPLEX task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the agent; used as the checkpoint key.
    pub name: String,
    /// Per-step timeout; the workflow deadline still applies on top of it.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Steps run once unless they opt into a bounded retry.
    #[serde(default)]
    pub retry: Option<StepRetry>,
}

impl StepDefinition {
    /// A step with default timeout and no retry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_ms: None,
            retry: None,
        }
    }

    /// Override the executor's default step timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Opt into bounded retries.
    pub fn with_retry(mut self, retry: StepRetry) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Step timeout, if overridden.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Attempts allowed, 1 unless retries are enabled.
    pub fn max_attempts(&self) -> u32 {
        self.retry.map_or(1, |r| r.max_attempts.max(1))
    }
}

/// Contract every execution unit implements.
///
/// Agents are shared behind `Arc` and called through `&self`; state that
/// changes across the lifecycle lives behind interior mutability.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Prepare resources. Called lazily before the first execution.
    async fn initialize(&self, options: &Value) -> Result<(), AgentError>;

    async fn execute(&self, input: AgentInput) -> Result<Value, AgentError>;

    /// Pre-flight check. `Ok(false)` rejects the input without executing.
    async fn validate(&self, _input: &AgentInput) -> Result<bool, AgentError> {
        Ok(true)
    }

    /// Release resources. Must succeed when nothing is running.
    async fn stop(&self) -> Result<(), AgentError>;

    fn status(&self) -> AgentStatus;

    /// Ordered steps the workflow executor runs for a COMPLEX task.
    fn workflow_steps(&self) -> Vec<StepDefinition> {
        vec![StepDefinition::new(DEFAULT_STEP)]
    }
}
