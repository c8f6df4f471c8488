use crate::config::ConductorConfig;
use crate::monitor::{LogMonitor, TaskMonitor, WebhookMonitor};
use crate::queue::QueueExecutor;
use crate::registry::{Report, StatusRegistry, TaskFilter, TaskStream};
use crate::scheduler::{CronScheduler, Occurrence};
use crate::workflow::{FailWorkflow, FailureHandler, WorkflowExecutor};
use conductor_agent::{Agent, AgentDescriptor, AgentRegistry, AgentStatus};
use conductor_core::{
    AgentError, CancelError, ConductorError, ConductorResult, ErrorContext, TaskClass,
    TaskDescriptor, TaskId, TaskRecord, TaskRequest, TaskState, TaskStatus,
};
use conductor_store::TaskStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

/// Hands classified tasks to the executor that owns their class.
struct Router {
    registry: Arc<StatusRegistry>,
    queue: QueueExecutor,
    workflows: WorkflowExecutor,
}

impl Router {
    async fn dispatch(&self, descriptor: TaskDescriptor) {
        let task_id = descriptor.task_id;
        match descriptor.task_class {
            TaskClass::Simple => {
                debug!(task_id = %task_id, "Routing to queue executor");
                self.queue.submit(descriptor);
            }
            TaskClass::Complex => {
                debug!(task_id = %task_id, "Routing to workflow executor");
                let payload = descriptor.payload.clone();
                if let Err(e) = self.workflows.start(descriptor) {
                    error!(task_id = %task_id, error = %e, "Workflow dispatch failed");
                    let context =
                        ErrorContext::from_agent_error(&AgentError::dispatch(e.to_string()), 0)
                            .with_payload(payload);
                    if let Err(e) = self.registry.report(task_id, Report::failed(context)).await {
                        error!(task_id = %task_id, error = %e, "Failed to record dispatch failure");
                    }
                }
            }
        }
    }

    async fn pump(self: Arc<Self>, mut occurrences: mpsc::UnboundedReceiver<Occurrence>) {
        while let Some(Occurrence { descriptor, first }) = occurrences.recv().await {
            let task_id = descriptor.task_id;
            if first {
                match self.registry.get(task_id).map(|s| s.status) {
                    Some(TaskStatus::Pending) => self.dispatch(descriptor).await,
                    status => debug!(task_id = %task_id, status = ?status, "Skipping stale occurrence"),
                }
                continue;
            }
            match self.registry.create(descriptor.clone()).await {
                Ok(_) => self.dispatch(descriptor).await,
                Err(e) => error!(task_id = %task_id, error = %e, "Failed to accept recurring task"),
            }
        }
    }
}

/// Builder for an [`Orchestrator`].
///
/// Everything the orchestrator depends on is injected here; nothing is
/// looked up from globals.
pub struct OrchestratorBuilder {
    config: ConductorConfig,
    store: Option<Arc<dyn TaskStore>>,
    monitors: Vec<Arc<dyn TaskMonitor>>,
    failure_handler: Option<Arc<dyn FailureHandler>>,
}

impl OrchestratorBuilder {
    /// Start from a configuration.
    pub fn new(config: ConductorConfig) -> Self {
        Self {
            config,
            store: None,
            monitors: Vec::new(),
            failure_handler: None,
        }
    }

    /// Use this store instead of opening the one named in the config.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add an event sink next to the configured ones.
    pub fn with_monitor(mut self, monitor: Arc<dyn TaskMonitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    /// Replace the default handler, which fails the workflow.
    pub fn with_failure_handler(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    /// Open the store and wire the executors.
    pub async fn build(self) -> ConductorResult<Orchestrator> {
        let store = match self.store {
            Some(store) => store,
            None => self.config.storage.open().await?,
        };

        let mut monitors = self.monitors;
        if self.config.monitor.log_events {
            monitors.push(Arc::new(LogMonitor));
        }
        if let Some(url) = &self.config.monitor.webhook_url {
            monitors.push(Arc::new(WebhookMonitor::new(url.clone())?));
        }

        let failure_handler: Arc<dyn FailureHandler> = match self.failure_handler {
            Some(handler) => handler,
            None => Arc::new(FailWorkflow),
        };
        let agents = Arc::new(AgentRegistry::new());
        let registry = Arc::new(StatusRegistry::new(Arc::clone(&store), monitors));
        let queue = QueueExecutor::new(
            self.config.queue.clone(),
            Arc::clone(&registry),
            Arc::clone(&agents),
        );
        let workflows = WorkflowExecutor::new(
            self.config.workflow.clone(),
            Arc::clone(&registry),
            Arc::clone(&agents),
            Arc::clone(&store),
            failure_handler,
        );
        let (scheduler, occurrences) = CronScheduler::new();

        Ok(Orchestrator {
            config: self.config,
            agents,
            registry: Arc::clone(&registry),
            store,
            router: Arc::new(Router {
                registry,
                queue,
                workflows,
            }),
            scheduler,
            occurrences: Mutex::new(Some(occurrences)),
            pump: Mutex::new(None),
            phase: Mutex::new(Phase::Created),
        })
    }
}

/// Single entry point of the orchestration core.
///
/// Classifies submitted tasks, routes SIMPLE ones to the queue executor and
/// COMPLEX ones to the workflow executor, and answers status queries from
/// the status registry. Tasks may be scheduled before [`Orchestrator::start`];
/// they stay PENDING until the executors run.
pub struct Orchestrator {
    config: ConductorConfig,
    agents: Arc<AgentRegistry>,
    registry: Arc<StatusRegistry>,
    store: Arc<dyn TaskStore>,
    router: Arc<Router>,
    scheduler: CronScheduler,
    occurrences: Mutex<Option<mpsc::UnboundedReceiver<Occurrence>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    phase: Mutex<Phase>,
}

impl Orchestrator {
    /// Start building an orchestrator.
    pub fn builder(config: ConductorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Configuration the orchestrator was built with.
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// Backing task store.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    // --- agents ---

    /// Register an agent with no initialization options.
    pub fn register_agent(
        &self,
        descriptor: AgentDescriptor,
        agent: Arc<dyn Agent>,
    ) -> ConductorResult<()> {
        self.agents.register(descriptor, agent)?;
        Ok(())
    }

    /// Register an agent whose `initialize` receives `options`.
    pub fn register_agent_with_options(
        &self,
        descriptor: AgentDescriptor,
        agent: Arc<dyn Agent>,
        options: Value,
    ) -> ConductorResult<()> {
        self.agents.register_with_options(descriptor, agent, options)?;
        Ok(())
    }

    /// Remove and stop an agent. Tasks already accepted for it fail at
    /// dispatch. Returns `false` for an unknown id.
    pub async fn unregister_agent(&self, agent_id: &str) -> ConductorResult<bool> {
        let Some(handle) = self.agents.unregister(agent_id) else {
            return Ok(false);
        };
        handle.stop().await?;
        Ok(true)
    }

    /// Agents advertising `capability`.
    pub fn discover(&self, capability: &str) -> Vec<AgentDescriptor> {
        self.agents.discover(capability)
    }

    /// Descriptors of every registered agent.
    pub fn agents(&self) -> Vec<AgentDescriptor> {
        self.agents.list_descriptors()
    }

    /// Status of one agent, if registered.
    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.agents.get(agent_id).map(|h| h.status())
    }

    // --- tasks ---

    /// Accept a task and return its id without waiting for execution.
    ///
    /// The task is PENDING and queryable when this returns. Classification,
    /// unknown agents and malformed cron expressions are rejected before any
    /// state is created.
    pub async fn schedule(&self, request: TaskRequest) -> ConductorResult<TaskId> {
        if *self.phase.lock() == Phase::Stopped {
            return Err(ConductorError::Lifecycle(
                "orchestrator is stopped".to_string(),
            ));
        }
        let mut descriptor = TaskDescriptor::from_request(request)?;
        if !self.agents.contains(&descriptor.agent_id) {
            return Err(ConductorError::UnknownAgent(descriptor.agent_id));
        }
        if let Some(expr) = &descriptor.options.cron_expression {
            CronScheduler::parse_cron(expr)?;
        }
        self.apply_defaults(&mut descriptor);

        let task_id = descriptor.task_id;
        self.registry.create(descriptor.clone()).await?;
        info!(
            task_id = %task_id,
            agent = %descriptor.agent_id,
            class = %descriptor.task_class,
            priority = descriptor.options.priority,
            "Task accepted"
        );

        if descriptor.options.cron_expression.is_some() {
            self.scheduler.schedule(descriptor, true)?;
        } else {
            self.router.dispatch(descriptor).await;
        }
        Ok(task_id)
    }

    fn apply_defaults(&self, descriptor: &mut TaskDescriptor) {
        let options = &mut descriptor.options;
        match descriptor.task_class {
            TaskClass::Simple => {
                options
                    .max_attempts
                    .get_or_insert(self.config.queue.default_max_attempts);
                options
                    .timeout_ms
                    .get_or_insert(self.config.queue.default_timeout_ms);
            }
            TaskClass::Complex => {
                options
                    .timeout_ms
                    .get_or_insert(self.config.workflow.default_timeout_ms);
                options
                    .task_queue_name
                    .get_or_insert_with(|| self.config.workflow.default_task_queue.clone());
            }
        }
    }

    /// Current state of a task.
    pub fn get_status(&self, task_id: TaskId) -> ConductorResult<TaskState> {
        self.registry
            .get(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))
    }

    /// Descriptor and state together.
    pub fn get_task(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.registry.record(task_id)
    }

    /// Tasks matching `filter`, oldest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        self.registry.list(filter)
    }

    /// Cancel a task through the executor that owns it.
    ///
    /// `Ok(false)` when the task is already terminal. Cancelling a recurring
    /// template also stops its schedule.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, CancelError> {
        let record = self
            .registry
            .record(task_id)
            .ok_or(CancelError::NotFound(task_id))?;
        if record.state.is_terminal() {
            return Ok(false);
        }
        let descriptor = record.descriptor;
        if descriptor.options.cron_expression.is_some() {
            self.scheduler.cancel(task_id);
        }
        match descriptor.task_class {
            TaskClass::Simple => self.router.queue.cancel(task_id).await,
            TaskClass::Complex => self.router.workflows.cancel(&descriptor).await,
        }
    }

    /// Stop future occurrences of a recurring task. Occurrences already
    /// fired are unaffected.
    pub fn cancel_schedule(&self, schedule_id: TaskId) -> bool {
        self.scheduler.cancel(schedule_id)
    }

    /// State updates of tasks accepted by `predicate`.
    pub fn subscribe<F>(&self, predicate: F) -> TaskStream
    where
        F: Fn(&TaskDescriptor, &TaskState) -> bool + Send + Sync + 'static,
    {
        self.registry.subscribe(predicate)
    }

    /// Resolve once the task is COMPLETED, FAILED or CANCELLED.
    pub async fn wait(&self, task_id: TaskId) -> ConductorResult<TaskState> {
        self.registry.wait(task_id).await
    }

    /// Drop a terminal task from the registry and the store.
    pub async fn purge(&self, task_id: TaskId) -> ConductorResult<bool> {
        self.registry.purge(task_id).await
    }

    // --- lifecycle ---

    /// Recover persisted work, then start the executors.
    pub async fn start(&self) -> ConductorResult<()> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Created => *phase = Phase::Running,
                Phase::Running => {
                    return Err(ConductorError::Lifecycle(
                        "orchestrator already started".to_string(),
                    ))
                }
                Phase::Stopped => {
                    return Err(ConductorError::Lifecycle(
                        "a stopped orchestrator cannot be restarted".to_string(),
                    ))
                }
            }
        }

        let recovered = self.recover().await?;

        if let Some(occurrences) = self.occurrences.lock().take() {
            let router = Arc::clone(&self.router);
            *self.pump.lock() = Some(tokio::spawn(router.pump(occurrences)));
        }
        self.router.queue.start();
        self.router.workflows.activate();
        info!(
            recovered,
            agents = self.agents.agent_count(),
            "Orchestrator started"
        );
        Ok(())
    }

    /// Reload persisted tasks and hand unfinished ones back to their
    /// executors. Returns how many tasks were resumed.
    async fn recover(&self) -> ConductorResult<usize> {
        let mut resumed = 0;
        for record in self.store.list_tasks().await? {
            let descriptor = record.descriptor.clone();
            let state = record.state.clone();
            if !self.registry.restore(record) {
                continue;
            }

            let is_template =
                descriptor.options.cron_expression.is_some() && descriptor.schedule_id.is_none();
            if is_template && state.status != TaskStatus::Cancelled {
                let first_pending = state.status == TaskStatus::Pending;
                if let Err(e) = self.scheduler.schedule(descriptor.clone(), first_pending) {
                    warn!(task_id = %descriptor.task_id, error = %e, "Failed to re-arm schedule");
                }
                if first_pending {
                    continue;
                }
            }
            if state.is_terminal() {
                continue;
            }

            match descriptor.task_class {
                TaskClass::Simple => {
                    let attempt = if state.status == TaskStatus::Pending {
                        1
                    } else {
                        (state.attempts + 1).min(descriptor.max_attempts())
                    };
                    info!(task_id = %descriptor.task_id, attempt, "Recovering queued task");
                    self.router.queue.resubmit(descriptor, attempt);
                }
                TaskClass::Complex => {
                    info!(task_id = %descriptor.task_id, workflow_id = %descriptor.workflow_id(), "Recovering workflow");
                    self.router.dispatch(descriptor).await;
                }
            }
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Stop scheduling, abort in-flight work, then stop every agent.
    /// Interrupted tasks keep their persisted state for the next start.
    pub async fn stop(&self) -> ConductorResult<()> {
        {
            let mut phase = self.phase.lock();
            if *phase == Phase::Stopped {
                return Ok(());
            }
            *phase = Phase::Stopped;
        }

        self.scheduler.shutdown();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
        self.router.queue.shutdown().await;
        self.router.workflows.shutdown().await;

        for (agent_id, e) in self.agents.stop_all().await {
            warn!(agent = %agent_id, error = %e, "Agent failed to stop");
        }
        info!("Orchestrator stopped");
        Ok(())
    }

    /// Whether `start` ran and `stop` has not.
    pub fn is_running(&self) -> bool {
        *self.phase.lock() == Phase::Running
    }
}
