use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, TaskClass, TaskId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lifecycle moment a [`TaskEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// First attempt or workflow run began.
    Started,
    /// An attempt failed and another is scheduled.
    Retrying,
    /// Reached COMPLETED.
    Completed,
    /// Reached FAILED.
    Failed,
    /// Reached CANCELLED.
    Cancelled,
}

impl std::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskEventKind::Started => "started",
            TaskEventKind::Retrying => "retrying",
            TaskEventKind::Completed => "completed",
            TaskEventKind::Failed => "failed",
            TaskEventKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One task lifecycle event, as delivered to monitors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task the event is about.
    pub task_id: TaskId,
    /// Target agent.
    pub agent_id: String,
    /// Executor class.
    pub task_class: TaskClass,
    /// What happened.
    pub kind: TaskEventKind,
    /// Attempt or run number.
    pub attempt: u32,
    /// When the report was applied.
    pub at: DateTime<Utc>,
    /// Error message or result summary, depending on `kind`.
    #[serde(default)]
    pub detail: Option<Value>,
}

/// Sink for lifecycle events.
///
/// Delivery is fire-and-forget: a failing monitor is logged and never
/// affects the task it reports on.
#[async_trait]
pub trait TaskMonitor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &TaskEvent) -> ConductorResult<()>;
}

/// Hand an event to every monitor on a background task.
pub fn notify_monitors(monitors: &[Arc<dyn TaskMonitor>], event: TaskEvent) {
    if monitors.is_empty() {
        return;
    }
    let monitors = monitors.to_vec();
    tokio::spawn(async move {
        for monitor in monitors {
            if let Err(e) = monitor.on_event(&event).await {
                warn!(
                    monitor = monitor.name(),
                    task_id = %event.task_id,
                    kind = %event.kind,
                    error = %e,
                    "Monitor failed to handle event"
                );
            }
        }
    });
}

/// Emits each event as a structured `tracing` record.
#[derive(Debug, Default)]
pub struct LogMonitor;

#[async_trait]
impl TaskMonitor for LogMonitor {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_event(&self, event: &TaskEvent) -> ConductorResult<()> {
        match event.kind {
            TaskEventKind::Failed | TaskEventKind::Retrying => warn!(
                task_id = %event.task_id,
                agent = %event.agent_id,
                class = %event.task_class,
                attempt = event.attempt,
                detail = ?event.detail,
                "Task {}", event.kind
            ),
            _ => info!(
                task_id = %event.task_id,
                agent = %event.agent_id,
                class = %event.task_class,
                attempt = event.attempt,
                "Task {}", event.kind
            ),
        }
        Ok(())
    }
}

/// POSTs each event as JSON to a fixed URL.
pub struct WebhookMonitor {
    url: String,
    client: reqwest::Client,
}

impl WebhookMonitor {
    /// POST events to `url`.
    pub fn new(url: impl Into<String>) -> ConductorResult<Self> {
        let url = url.into();
        reqwest::Url::parse(&url)
            .map_err(|e| ConductorError::Config(format!("Invalid monitor webhook url '{url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConductorError::Monitor(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl TaskMonitor for WebhookMonitor {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn on_event(&self, event: &TaskEvent) -> ConductorResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| ConductorError::Monitor(format!("Event delivery failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ConductorError::Monitor(format!(
                "Event endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Per-agent lifecycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Tasks started.
    pub started: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Tasks completed.
    pub completed: u64,
    /// Tasks failed.
    pub failed: u64,
    /// Tasks cancelled.
    pub cancelled: u64,
}

impl AgentMetrics {
    fn record(&mut self, kind: TaskEventKind) {
        match kind {
            TaskEventKind::Started => self.started += 1,
            TaskEventKind::Retrying => self.retried += 1,
            TaskEventKind::Completed => self.completed += 1,
            TaskEventKind::Failed => self.failed += 1,
            TaskEventKind::Cancelled => self.cancelled += 1,
        }
    }

    fn add(&mut self, other: &AgentMetrics) {
        self.started += other.started;
        self.retried += other.retried;
        self.completed += other.completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

/// Aggregates events into per-agent counters.
#[derive(Default)]
pub struct MetricsMonitor {
    agents: RwLock<HashMap<String, AgentMetrics>>,
}

impl MetricsMonitor {
    /// Empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters of one agent.
    pub fn get(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.agents.read().get(agent_id).cloned()
    }

    /// Counters of every agent seen so far.
    pub fn snapshot(&self) -> HashMap<String, AgentMetrics> {
        self.agents.read().clone()
    }

    /// Totals across all agents.
    pub fn aggregate(&self) -> AgentMetrics {
        let mut total = AgentMetrics::default();
        for metrics in self.agents.read().values() {
            total.add(metrics);
        }
        total
    }

    /// Per-agent counters plus a `total` entry.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "agents": self.snapshot(),
            "aggregate": self.aggregate(),
        })
    }
}

#[async_trait]
impl TaskMonitor for MetricsMonitor {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn on_event(&self, event: &TaskEvent) -> ConductorResult<()> {
        self.agents
            .write()
            .entry(event.agent_id.clone())
            .or_default()
            .record(event.kind);
        Ok(())
    }
}
