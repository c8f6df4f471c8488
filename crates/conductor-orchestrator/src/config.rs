use conductor_agent::WebhookAgentConfig;
use conductor_core::{BackoffPolicy, ConductorError, ConductorResult};
use conductor_store::{FileTaskStore, MemoryTaskStore, TaskStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration, usually read from `conductor.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// SIMPLE task execution.
    #[serde(default)]
    pub queue: QueueConfig,
    /// COMPLEX task execution.
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Persistence backend.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Lifecycle event sinks.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Agents declared in configuration.
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl ConductorConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> ConductorResult<Self> {
        toml::from_str(raw).map_err(|e| ConductorError::Config(format!("Invalid config: {e}")))
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }
}

/// Queue executor settings (SIMPLE tasks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker pool size.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts for tasks that set none.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Per-attempt timeout for tasks that set none.
    #[serde(default = "default_queue_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Global dequeue rate limit.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Backoff between attempts.
    #[serde(default)]
    pub retry: BackoffPolicy,
}

impl QueueConfig {
    /// `default_timeout_ms` as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_max_attempts: default_max_attempts(),
            default_timeout_ms: default_queue_timeout_ms(),
            rate_limit: RateLimitConfig::default(),
            retry: BackoffPolicy::default(),
        }
    }
}

/// Global token bucket: `tokens` become available every `refill_interval_ms`.
/// Zero tokens disables rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens per interval.
    #[serde(default = "default_tokens")]
    pub tokens: u32,
    /// Interval after which the bucket is full again.
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens: default_tokens(),
            refill_interval_ms: default_refill_interval_ms(),
        }
    }
}

/// Workflow executor settings (COMPLEX tasks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflows driven at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Timeout for steps that set none.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
    /// Whole-workflow timeout for tasks that set none.
    #[serde(default = "default_workflow_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Task queue for tasks that name none.
    #[serde(default = "default_task_queue")]
    pub default_task_queue: String,
}

impl WorkflowConfig {
    /// `default_step_timeout_ms` as a [`Duration`].
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    /// `default_timeout_ms` as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_step_timeout_ms: default_step_timeout_ms(),
            default_timeout_ms: default_workflow_timeout_ms(),
            default_task_queue: default_task_queue(),
        }
    }
}

/// Where task state and workflow checkpoints are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Nothing survives a restart.
    #[default]
    Memory,
    /// One JSON file per record under `dir`.
    File {
        dir: PathBuf,
    },
    /// SQLite database at `path`.
    Sqlite {
        path: PathBuf,
    },
}

impl StorageConfig {
    /// Open the configured backend.
    pub async fn open(&self) -> ConductorResult<Arc<dyn TaskStore>> {
        match self {
            StorageConfig::Memory => Ok(Arc::new(MemoryTaskStore::new())),
            StorageConfig::File { dir } => Ok(Arc::new(FileTaskStore::new(dir.clone()).await?)),
            #[cfg(feature = "sqlite")]
            StorageConfig::Sqlite { path } => {
                Ok(Arc::new(conductor_store::SqliteTaskStore::open(path)?))
            }
            #[cfg(not(feature = "sqlite"))]
            StorageConfig::Sqlite { path } => Err(ConductorError::Config(format!(
                "storage backend 'sqlite' ({}) requires the `sqlite` feature",
                path.display()
            ))),
        }
    }
}

/// Built-in lifecycle event sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Emit lifecycle events through `tracing`.
    #[serde(default = "default_true")]
    pub log_events: bool,
    /// POST lifecycle events to this URL.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_events: true,
            webhook_url: None,
        }
    }
}

/// Agents registered by the CLI at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// HTTP-backed agents.
    #[serde(default)]
    pub webhooks: Vec<WebhookAgentConfig>,
}

fn default_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_queue_timeout_ms() -> u64 {
    30_000
}
fn default_tokens() -> u32 {
    50
}
fn default_refill_interval_ms() -> u64 {
    1_000
}
fn default_max_concurrent() -> usize {
    16
}
fn default_step_timeout_ms() -> u64 {
    300_000
}
fn default_workflow_timeout_ms() -> u64 {
    86_400_000
}
fn default_task_queue() -> String {
    "default".to_string()
}
fn default_true() -> bool {
    true
}
