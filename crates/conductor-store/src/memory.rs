use crate::store::{sort_by_submission, TaskStore};
use async_trait::async_trait;
use conductor_core::{
    ConductorError, ConductorResult, ExecutionRecord, TaskId, TaskRecord, TaskState,
};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Non-durable store. Everything is lost with the process.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    executions: RwLock<HashMap<String, ExecutionRecord>>,
}

impl MemoryTaskStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_task(&self, record: &TaskRecord) -> ConductorResult<()> {
        self.tasks
            .write()
            .insert(record.descriptor.task_id, record.clone());
        Ok(())
    }

    async fn update_state(&self, state: &TaskState) -> ConductorResult<()> {
        let mut tasks = self.tasks.write();
        let record = tasks
            .get_mut(&state.task_id)
            .ok_or(ConductorError::TaskNotFound(state.task_id))?;
        record.state = state.clone();
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> ConductorResult<Option<TaskRecord>> {
        Ok(self.tasks.read().get(&task_id).cloned())
    }

    async fn list_tasks(&self) -> ConductorResult<Vec<TaskRecord>> {
        let mut records: Vec<_> = self.tasks.read().values().cloned().collect();
        sort_by_submission(&mut records);
        Ok(records)
    }

    async fn delete_task(&self, task_id: TaskId) -> ConductorResult<bool> {
        Ok(self.tasks.write().remove(&task_id).is_some())
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> ConductorResult<()> {
        self.executions
            .write()
            .insert(record.workflow_id.clone(), record.clone());
        Ok(())
    }

    async fn get_execution(&self, workflow_id: &str) -> ConductorResult<Option<ExecutionRecord>> {
        Ok(self.executions.read().get(workflow_id).cloned())
    }

    async fn list_executions(&self) -> ConductorResult<Vec<ExecutionRecord>> {
        let mut records: Vec<_> = self.executions.read().values().cloned().collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    async fn delete_execution(&self, workflow_id: &str) -> ConductorResult<bool> {
        Ok(self.executions.write().remove(workflow_id).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use conductor_core::{TaskClass, TaskDescriptor, TaskOptions, TaskStatus};
    use serde_json::json;

    fn record() -> TaskRecord {
        let descriptor =
            TaskDescriptor::new("a", TaskClass::Simple, json!({}), TaskOptions::default());
        let state = TaskState::pending(descriptor.task_id);
        TaskRecord { descriptor, state }
    }

    #[tokio::test]
    async fn test_update_unknown_task() {
        let store = MemoryTaskStore::new();
        let err = store
            .update_state(&TaskState::pending(uuid::Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_update_replaces_state() {
        let store = MemoryTaskStore::new();
        let rec = record();
        store.insert_task(&rec).await.unwrap();
        let mut state = rec.state.clone();
        state.status = TaskStatus::Running;
        state.attempts = 1;
        store.update_state(&state).await.unwrap();
        let loaded = store.get_task(rec.descriptor.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.state.status, TaskStatus::Running);
        assert_eq!(loaded.descriptor, rec.descriptor);
    }
}
