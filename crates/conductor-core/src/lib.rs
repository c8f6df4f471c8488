//! Core types and error definitions for the Conductor orchestration core.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the task model handed from callers to executors, the persisted
//! workflow checkpoint, and the unified error taxonomy.
//!
//! # Main types
//!
//! - [`TaskRequest`] — Untyped submission as received from a caller.
//! - [`TaskDescriptor`] — Immutable, classified unit of work.
//! - [`TaskState`] — Mutable execution state mirrored by the status registry.
//! - [`ExecutionRecord`] — Checkpointed progress of a COMPLEX task.
//! - [`ConductorError`] — Unified error enum; [`ConductorResult`] alias.
//! - [`AgentError`] — Failures raised through the agent contract.
//! - [`BackoffPolicy`] — Exponential backoff shared by both executors.

/// Error taxonomy.
pub mod error;
/// Backoff and step retry policies.
pub mod retry;
/// Task, state and checkpoint types.
pub mod types;

pub use error::{AgentError, AgentErrorKind, CancelError, ConductorError, ConductorResult};
pub use retry::{BackoffPolicy, StepRetry};
pub use types::{
    ErrorContext, ExecutionRecord, TaskClass, TaskDescriptor, TaskId, TaskOptions, TaskRecord,
    TaskRequest, TaskState, TaskStatus, WorkflowStatus,
};
