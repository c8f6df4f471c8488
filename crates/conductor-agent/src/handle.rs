use crate::agent::{Agent, AgentDescriptor, AgentInput, AgentStatus, StepDefinition};
use conductor_core::AgentError;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Lifecycle wrapper the executors call agents through.
///
/// Initializes the agent on first use, serializes executions unless the
/// agent is reentrant, and turns repeated `stop` calls into no-ops.
pub struct AgentHandle {
    descriptor: AgentDescriptor,
    agent: Arc<dyn Agent>,
    options: Value,
    initialized: OnceCell<()>,
    gate: Mutex<()>,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("descriptor", &self.descriptor)
            .field("stopped", &self.stopped)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl AgentHandle {
    /// Wrap an agent that needs no initialization options.
    pub fn new(descriptor: AgentDescriptor, agent: Arc<dyn Agent>) -> Self {
        Self::with_options(descriptor, agent, Value::Null)
    }

    /// `options` is handed to [`Agent::initialize`].
    pub fn with_options(descriptor: AgentDescriptor, agent: Arc<dyn Agent>, options: Value) -> Self {
        Self {
            descriptor,
            agent,
            options,
            initialized: OnceCell::new(),
            gate: Mutex::new(()),
            stopped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Registry key of the wrapped agent.
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Descriptor the agent was registered with.
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Status as reported by the agent.
    pub fn status(&self) -> AgentStatus {
        self.agent.status()
    }

    /// Steps the agent runs for COMPLEX tasks.
    pub fn workflow_steps(&self) -> Vec<StepDefinition> {
        self.agent.workflow_steps()
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// Whether `stop` was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Executions currently inside `execute`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `initialize` once. A failed initialization is retried on the next call.
    pub async fn ensure_initialized(&self) -> Result<(), AgentError> {
        self.initialized
            .get_or_try_init(|| async {
                info!(agent = %self.descriptor.id, version = %self.descriptor.version, "Initializing agent");
                self.agent.initialize(&self.options).await
            })
            .await?;
        Ok(())
    }

    /// Validate and execute one input.
    ///
    /// A validation that returns `Ok(false)` becomes a non-retryable
    /// validation error.
    pub async fn run(&self, input: AgentInput) -> Result<Value, AgentError> {
        self.run_inner(input, None).await
    }

    /// Like [`AgentHandle::run`], with `timeout` bounding only the call to
    /// [`Agent::execute`]. Waiting for a busy non-reentrant agent is not
    /// counted against it.
    pub async fn run_with_timeout(
        &self,
        input: AgentInput,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        self.run_inner(input, Some(timeout)).await
    }

    async fn run_inner(
        &self,
        input: AgentInput,
        timeout: Option<Duration>,
    ) -> Result<Value, AgentError> {
        if self.is_stopped() {
            return Err(AgentError::dispatch(format!(
                "agent '{}' is stopped",
                self.descriptor.id
            )));
        }
        self.ensure_initialized().await?;

        if !self.agent.validate(&input).await? {
            return Err(AgentError::validation(format!(
                "agent '{}' rejected the input",
                self.descriptor.id
            )));
        }

        let _guard = if self.descriptor.is_reentrant() {
            None
        } else {
            Some(self.gate.lock().await)
        };

        debug!(
            agent = %self.descriptor.id,
            task_id = %input.task_id,
            attempt = input.attempt,
            step = input.step_name().unwrap_or("-"),
            "Executing"
        );
        let _counter = InFlight::enter(&self.in_flight);
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.agent.execute(input))
                .await
                .unwrap_or_else(|_| Err(AgentError::timeout(timeout))),
            None => self.agent.execute(input).await,
        }
    }

    /// Stop the agent. Only the first call reaches [`Agent::stop`].
    pub async fn stop(&self) -> Result<(), AgentError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(agent = %self.descriptor.id, "Stopping agent");
        if let Err(e) = self.agent.stop().await {
            warn!(agent = %self.descriptor.id, error = %e, "Agent stop failed");
            return Err(e);
        }
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
