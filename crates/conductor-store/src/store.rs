use async_trait::async_trait;
use conductor_core::{ConductorResult, ExecutionRecord, TaskId, TaskRecord, TaskState};

/// Durable storage for task records and workflow checkpoints.
///
/// A task record holds the descriptor together with its latest state so
/// that a restarted process can rebuild its registry and resume work.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task. Descriptor and initial state land together.
    async fn insert_task(&self, record: &TaskRecord) -> ConductorResult<()>;

    /// Replace the state of an existing task.
    async fn update_state(&self, state: &TaskState) -> ConductorResult<()>;

    async fn get_task(&self, task_id: TaskId) -> ConductorResult<Option<TaskRecord>>;

    /// All tasks, oldest submission first.
    async fn list_tasks(&self) -> ConductorResult<Vec<TaskRecord>>;

    /// Returns `false` when no such task was stored.
    async fn delete_task(&self, task_id: TaskId) -> ConductorResult<bool>;

    /// Insert or replace the checkpoint of a workflow.
    async fn save_execution(&self, record: &ExecutionRecord) -> ConductorResult<()>;

    async fn get_execution(&self, workflow_id: &str) -> ConductorResult<Option<ExecutionRecord>>;

    async fn list_executions(&self) -> ConductorResult<Vec<ExecutionRecord>>;

    async fn delete_execution(&self, workflow_id: &str) -> ConductorResult<bool>;
}

pub(crate) fn sort_by_submission(records: &mut [TaskRecord]) {
    records.sort_by(|a, b| {
        a.descriptor
            .submitted_at
            .cmp(&b.descriptor.submitted_at)
            .then_with(|| a.descriptor.task_id.cmp(&b.descriptor.task_id))
    });
}
