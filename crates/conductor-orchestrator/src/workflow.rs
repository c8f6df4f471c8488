use crate::config::WorkflowConfig;
use crate::registry::{Report, StatusRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_agent::{AgentHandle, AgentInput, AgentRegistry, StepContext, StepDefinition};
use conductor_core::{
    AgentError, CancelError, ConductorError, ConductorResult, ErrorContext, ExecutionRecord,
    TaskDescriptor, TaskId, WorkflowStatus,
};
use conductor_store::TaskStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What to do after a workflow step failed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Mark the workflow FAILED.
    Fail,
    /// Checkpoint the step with a `null` output and carry on.
    Continue,
}

/// Hook consulted when a step exhausts its attempts.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn handle_failure(&self, workflow_id: &str, error: &ErrorContext) -> FailureAction;
}

/// Default handler: every step failure fails the workflow.
#[derive(Debug, Default)]
pub struct FailWorkflow;

#[async_trait]
impl FailureHandler for FailWorkflow {
    async fn handle_failure(&self, _workflow_id: &str, _error: &ErrorContext) -> FailureAction {
        FailureAction::Fail
    }
}

const ACTIVE: u8 = 0;
const CANCEL_REQUESTED: u8 = 1;
const SEALED: u8 = 2;

/// Cooperative cancellation flag, observed at checkpoint boundaries.
///
/// Before settling a workflow as completed or failed the driver seals the
/// flag. A request and a seal race on one compare-and-swap, so exactly one
/// of them wins: either the request is honored or it is refused.
#[derive(Default)]
struct CancelFlag {
    state: AtomicU8,
    notify: Notify,
}

impl CancelFlag {
    /// Returns `false` when the driver already committed to another outcome.
    fn cancel(&self) -> bool {
        match self.state.compare_exchange(
            ACTIVE,
            CANCEL_REQUESTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.notify.notify_waiters();
                true
            }
            Err(current) => current == CANCEL_REQUESTED,
        }
    }

    /// Returns `false` when a cancellation was requested first.
    fn seal(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, SEALED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCEL_REQUESTED
    }

    async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

struct RunningWorkflow {
    task_id: TaskId,
    cancel: Arc<CancelFlag>,
    driver: JoinHandle<()>,
}

struct WorkflowInner {
    registry: Arc<StatusRegistry>,
    agents: Arc<AgentRegistry>,
    store: Arc<dyn TaskStore>,
    failure_handler: Arc<dyn FailureHandler>,
    config: WorkflowConfig,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<String, RunningWorkflow>>,
}

/// Runs COMPLEX tasks as checkpointed step sequences.
///
/// The executor keeps one driver per in-flight workflow id. A driver loads
/// or creates the execution record, runs the remaining steps in order and
/// persists a checkpoint after each one, so a driver started after a
/// restart picks up at the first step that has no checkpoint.
///
/// Drivers need a permit to run. The executor is created with none and
/// receives `max_concurrent` permits on [`WorkflowExecutor::activate`];
/// until then accepted workflows stay PENDING.
pub struct WorkflowExecutor {
    inner: Arc<WorkflowInner>,
}

enum StepFailure {
    Failed(AgentError, u32),
    DeadlineExceeded(Duration),
}

impl WorkflowExecutor {
    /// Build an executor with no driver permits yet.
    pub fn new(
        config: WorkflowConfig,
        registry: Arc<StatusRegistry>,
        agents: Arc<AgentRegistry>,
        store: Arc<dyn TaskStore>,
        failure_handler: Arc<dyn FailureHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkflowInner {
                registry,
                agents,
                store,
                failure_handler,
                config,
                permits: Arc::new(Semaphore::new(0)),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Release driver permits.
    pub fn activate(&self) {
        let permits = self.inner.config.max_concurrent.max(1);
        self.inner.permits.add_permits(permits);
        info!(max_concurrent = permits, "Workflow executor started");
    }

    /// Start (or resume) the workflow of a COMPLEX task.
    pub fn start(&self, descriptor: TaskDescriptor) -> ConductorResult<()> {
        let workflow_id = descriptor.workflow_id();
        let mut running = self.inner.running.lock();
        if running.contains_key(&workflow_id) {
            return Err(ConductorError::WorkflowAlreadyRunning(workflow_id));
        }
        let cancel = Arc::new(CancelFlag::default());
        let task_id = descriptor.task_id;
        let inner = Arc::clone(&self.inner);
        let flag = Arc::clone(&cancel);
        let driver = tokio::spawn(async move { inner.drive(descriptor, flag).await });
        running.insert(
            workflow_id,
            RunningWorkflow {
                task_id,
                cancel,
                driver,
            },
        );
        Ok(())
    }

    /// Request cancellation. A running step finishes first; the workflow
    /// turns CANCELLED at the next checkpoint boundary.
    ///
    /// Returns `Ok(false)` when the driver is already settling the workflow
    /// as completed or failed.
    pub async fn cancel(&self, descriptor: &TaskDescriptor) -> Result<bool, CancelError> {
        let task_id = descriptor.task_id;
        let state = self
            .inner
            .registry
            .get(task_id)
            .ok_or(CancelError::NotFound(task_id))?;
        if state.is_terminal() {
            return Ok(false);
        }

        let flag = self
            .inner
            .running
            .lock()
            .get(&descriptor.workflow_id())
            .map(|r| Arc::clone(&r.cancel));
        if let Some(flag) = flag {
            if !flag.cancel() {
                info!(task_id = %task_id, "Workflow already finishing, cancellation refused");
                return Ok(false);
            }
            info!(task_id = %task_id, "Workflow cancellation requested");
            return Ok(true);
        }

        // No driver: nothing runs, so the state can be settled directly.
        match self.inner.registry.report(task_id, Report::cancelled()).await {
            Ok(_) => Ok(true),
            Err(ConductorError::InvalidTransition { .. }) => Ok(false),
            Err(_) => Err(CancelError::NotFound(task_id)),
        }
    }

    /// Whether a driver owns this workflow id.
    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.inner.running.lock().contains_key(workflow_id)
    }

    /// Number of live drivers.
    pub fn running_count(&self) -> usize {
        self.inner.running.lock().len()
    }

    /// Abort every driver. Execution records stay as persisted.
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        let drained: Vec<_> = self.inner.running.lock().drain().collect();
        for (workflow_id, running) in &drained {
            running.driver.abort();
            info!(workflow_id = %workflow_id, task_id = %running.task_id, "Workflow driver aborted");
        }
        for (_, running) in drained {
            let _ = running.driver.await;
        }
    }
}

impl WorkflowInner {
    async fn drive(self: Arc<Self>, descriptor: TaskDescriptor, cancel: Arc<CancelFlag>) {
        let task_id = descriptor.task_id;
        let workflow_id = descriptor.workflow_id();

        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            () = cancel.cancelled() => None,
        };

        let result = match permit {
            Some(_permit) => self.run(&descriptor, &cancel).await,
            None if cancel.is_cancelled() => self.settle_cancelled(task_id, None).await,
            None => Ok(()),
        };
        if let Err(e) = result {
            error!(task_id = %task_id, workflow_id = %workflow_id, error = %e, "Workflow driver failed");
            self.abandon(&descriptor, &cancel, &e).await;
        }
        self.running.lock().remove(&workflow_id);
    }

    /// Settle a task whose driver stopped on an infrastructure error, so
    /// waiters still observe a terminal state.
    async fn abandon(
        &self,
        descriptor: &TaskDescriptor,
        cancel: &CancelFlag,
        cause: &ConductorError,
    ) {
        let task_id = descriptor.task_id;
        let report = if cancel.is_cancelled() {
            Report::cancelled()
        } else {
            let attempt = self
                .registry
                .get(task_id)
                .map(|state| state.attempts.max(1))
                .unwrap_or(1);
            let error = AgentError::exec(format!("workflow driver stopped: {cause}"));
            Report::failed(
                ErrorContext::from_agent_error(&error, attempt)
                    .with_payload(descriptor.payload.clone()),
            )
        };
        if let Err(e) = self.registry.report(task_id, report).await {
            warn!(task_id = %task_id, error = %e, "Could not settle abandoned workflow");
        }
    }

    async fn run(&self, descriptor: &TaskDescriptor, cancel: &CancelFlag) -> ConductorResult<()> {
        let task_id = descriptor.task_id;
        let workflow_id = descriptor.workflow_id();

        let mut record = match self.store.get_execution(&workflow_id).await? {
            Some(record) if record.status.is_terminal() => {
                warn!(workflow_id = %workflow_id, status = ?record.status, "Workflow already finished");
                if !cancel.seal() {
                    return self.settle_cancelled(task_id, None).await;
                }
                return self.reconcile(descriptor, &record).await;
            }
            Some(record) => {
                info!(workflow_id = %workflow_id, step = record.current_step, "Resuming workflow");
                record
            }
            None => ExecutionRecord::new(task_id, workflow_id.clone()),
        };
        record.runs += 1;
        record.set_status(WorkflowStatus::Running);
        self.store.save_execution(&record).await?;
        self.registry
            .report(
                task_id,
                Report::running(record.runs)
                    .with_metadata("workflow_id", workflow_id.clone())
                    .with_metadata("current_step", record.current_step),
            )
            .await?;

        let Some(handle) = self.agents.get(&descriptor.agent_id) else {
            let error = AgentError::dispatch(format!(
                "agent '{}' is not registered",
                descriptor.agent_id
            ));
            let context = ErrorContext::from_agent_error(&error, record.runs)
                .with_payload(descriptor.payload.clone());
            if !cancel.seal() {
                return self.settle_cancelled(task_id, Some(&mut record)).await;
            }
            return self.settle_failed(&mut record, context).await;
        };

        let steps = handle.workflow_steps();
        let budget = descriptor
            .options
            .timeout()
            .unwrap_or_else(|| self.config.default_timeout());
        let deadline = chrono::Duration::from_std(budget)
            .ok()
            .and_then(|d| record.started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut last_output = steps
            .iter()
            .take(record.current_step)
            .last()
            .and_then(|s| record.checkpoint_data.get(&s.name).cloned())
            .unwrap_or(Value::Null);

        loop {
            if cancel.is_cancelled() {
                return self.settle_cancelled(task_id, Some(&mut record)).await;
            }
            let index = record.current_step;
            let Some(step) = steps.get(index) else {
                break;
            };

            match self
                .run_step(&handle, descriptor, &record, index, step, deadline)
                .await
            {
                Ok(output) => {
                    record.checkpoint(&step.name, output.clone());
                    self.store.save_execution(&record).await?;
                    self.registry
                        .report(
                            task_id,
                            Report::progress()
                                .with_metadata("current_step", record.current_step)
                                .with_metadata("last_step", step.name.clone()),
                        )
                        .await?;
                    info!(task_id = %task_id, step = %step.name, index, "Step checkpointed");
                    last_output = output;
                }
                Err(failure) => {
                    let context = match failure {
                        StepFailure::Failed(error, attempt) => {
                            ErrorContext::from_agent_error(&error, attempt)
                        }
                        StepFailure::DeadlineExceeded(budget) => {
                            let mut ctx =
                                ErrorContext::from_agent_error(&AgentError::timeout(budget), 1);
                            ctx.message = format!(
                                "workflow deadline of {}ms exceeded",
                                budget.as_millis()
                            );
                            ctx
                        }
                    }
                    .with_step(index, step.name.clone())
                    .with_payload(descriptor.payload.clone());

                    match self
                        .failure_handler
                        .handle_failure(&record.workflow_id, &context)
                        .await
                    {
                        FailureAction::Continue => {
                            warn!(task_id = %task_id, step = %step.name, error = %context.message, "Step failed, continuing");
                            record.checkpoint(&step.name, Value::Null);
                            self.store.save_execution(&record).await?;
                            self.registry
                                .report(
                                    task_id,
                                    Report::progress()
                                        .with_metadata("current_step", record.current_step)
                                        .with_metadata("skipped_step", step.name.clone()),
                                )
                                .await?;
                            last_output = Value::Null;
                        }
                        FailureAction::Fail => {
                            if !cancel.seal() {
                                return self.settle_cancelled(task_id, Some(&mut record)).await;
                            }
                            return self.settle_failed(&mut record, context).await;
                        }
                    }
                }
            }
        }

        if !cancel.seal() {
            return self.settle_cancelled(task_id, Some(&mut record)).await;
        }
        record.set_status(WorkflowStatus::Completed);
        self.store.save_execution(&record).await?;
        self.registry
            .report(task_id, Report::completed(last_output))
            .await?;
        info!(task_id = %task_id, workflow_id = %record.workflow_id, "Workflow completed");
        Ok(())
    }

    /// Run one step with its timeout and opt-in retries.
    async fn run_step(
        &self,
        handle: &AgentHandle,
        descriptor: &TaskDescriptor,
        record: &ExecutionRecord,
        index: usize,
        step: &StepDefinition,
        deadline: DateTime<Utc>,
    ) -> Result<Value, StepFailure> {
        let step_timeout = step
            .timeout()
            .unwrap_or_else(|| self.config.default_step_timeout());
        let max_attempts = step.max_attempts();
        let mut attempt = 1;
        loop {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                let budget = (deadline - record.started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                return Err(StepFailure::DeadlineExceeded(budget));
            }
            let timeout = step_timeout.min(remaining);
            let input = AgentInput::new(descriptor.task_id, attempt, descriptor.payload.clone())
                .with_step(StepContext {
                    index,
                    name: step.name.clone(),
                    checkpoint: record.checkpoint_data.clone(),
                });

            match handle.run_with_timeout(input, timeout).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = step
                        .retry
                        .map(|r| r.backoff.delay_for(attempt))
                        .unwrap_or_default();
                    warn!(
                        task_id = %descriptor.task_id,
                        step = %step.name,
                        attempt,
                        error = %e,
                        "Step attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(StepFailure::Failed(e, attempt)),
            }
        }
    }

    /// Bring the task state in line with an execution record that reached a
    /// terminal status before the state report was persisted.
    async fn reconcile(
        &self,
        descriptor: &TaskDescriptor,
        record: &ExecutionRecord,
    ) -> ConductorResult<()> {
        let report = match record.status {
            WorkflowStatus::Completed => {
                let output = self
                    .agents
                    .get(&descriptor.agent_id)
                    .and_then(|h| h.workflow_steps().last().map(|s| s.name.clone()))
                    .and_then(|name| record.checkpoint_data.get(&name).cloned())
                    .unwrap_or(Value::Null);
                Report::completed(output)
            }
            WorkflowStatus::Cancelled => Report::cancelled(),
            _ => {
                let error = AgentError::exec("workflow failed before the last restart");
                Report::failed(
                    ErrorContext::from_agent_error(&error, record.runs)
                        .with_payload(descriptor.payload.clone()),
                )
            }
        };
        self.registry.report(descriptor.task_id, report).await?;
        Ok(())
    }

    async fn settle_failed(
        &self,
        record: &mut ExecutionRecord,
        context: ErrorContext,
    ) -> ConductorResult<()> {
        warn!(
            task_id = %record.task_id,
            workflow_id = %record.workflow_id,
            step = context.step.as_deref().unwrap_or("-"),
            error = %context.message,
            "Workflow failed"
        );
        record.set_status(WorkflowStatus::Failed);
        self.store.save_execution(record).await?;
        self.registry
            .report(record.task_id, Report::failed(context))
            .await?;
        Ok(())
    }

    async fn settle_cancelled(
        &self,
        task_id: TaskId,
        record: Option<&mut ExecutionRecord>,
    ) -> ConductorResult<()> {
        if let Some(record) = record {
            record.set_status(WorkflowStatus::Cancelled);
            self.store.save_execution(record).await?;
        }
        self.registry.report(task_id, Report::cancelled()).await?;
        info!(task_id = %task_id, "Workflow cancelled");
        Ok(())
    }
}
