//! Agent contract for the Conductor orchestration core.
//!
//! Agents are the execution units tasks are dispatched to. This crate defines
//! the contract they implement, the [`AgentHandle`] executors call them
//! through, and the [`AgentRegistry`] that resolves them by id.
//!
//! # Main types
//!
//! - [`Agent`] — Trait implemented by every execution unit.
//! - [`AgentHandle`] — Lazy initialization, serialization and idempotent stop.
//! - [`AgentRegistry`] — Registration, lookup and capability discovery.
//! - [`WebhookAgent`] — Forwards executions to an HTTP endpoint.

/// The agent trait and its input and descriptor types.
pub mod agent;
/// Lifecycle wrapper around a registered agent.
pub mod handle;
/// Agent registry.
pub mod registry;
/// HTTP webhook agent.
pub mod webhook;

pub use agent::{
    Agent, AgentDescriptor, AgentInput, AgentState, AgentStatus, StepContext, StepDefinition,
    DEFAULT_STEP, REENTRANT_CAPABILITY,
};
pub use handle::AgentHandle;
pub use registry::AgentRegistry;
pub use webhook::{WebhookAgent, WebhookAgentConfig};
