//! Task routing and execution for the Conductor orchestration core.
//!
//! Accepts abstract work items and routes each to one of two executors
//! depending on its declared class: a priority queue with retries for short
//! SIMPLE tasks, and a checkpointed, resumable workflow driver for
//! long-running COMPLEX tasks. All status flows through one registry.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Public entry point: schedule, query, cancel, subscribe.
//! - [`QueueExecutor`] — Worker pool for SIMPLE tasks.
//! - [`WorkflowExecutor`] — Durable step runner for COMPLEX tasks.
//! - [`StatusRegistry`] — Task id to current state; persisted and subscribable.
//! - [`CronScheduler`] — Recurring submissions.
//! - [`TaskMonitor`] — Sink for lifecycle events.

/// Configuration loaded from `conductor.toml`.
pub mod config;
/// Orchestrator entry point and builder.
pub mod engine;
/// Lifecycle event sinks.
pub mod monitor;
/// Priority queue executor for SIMPLE tasks.
pub mod queue;
/// Token bucket rate limiter.
pub mod rate_limit;
/// Status registry.
pub mod registry;
/// Cron-based recurring scheduler.
pub mod scheduler;
/// Durable workflow executor for COMPLEX tasks.
pub mod workflow;

pub use config::{
    AgentsConfig, ConductorConfig, MonitorConfig, QueueConfig, RateLimitConfig, StorageConfig,
    WorkflowConfig,
};
pub use engine::{Orchestrator, OrchestratorBuilder};
pub use monitor::{
    AgentMetrics, LogMonitor, MetricsMonitor, TaskEvent, TaskEventKind, TaskMonitor,
    WebhookMonitor,
};
pub use queue::QueueExecutor;
pub use rate_limit::RateLimiter;
pub use registry::{Report, StatusRegistry, TaskFilter, TaskStream, LAST_ERROR, RETRY_IN_MS};
pub use scheduler::{CronScheduler, Occurrence};
pub use workflow::{FailWorkflow, FailureAction, FailureHandler, WorkflowExecutor};
