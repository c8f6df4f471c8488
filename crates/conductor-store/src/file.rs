use crate::store::{sort_by_submission, TaskStore};
use async_trait::async_trait;
use conductor_core::{
    ConductorError, ConductorResult, ExecutionRecord, TaskId, TaskRecord, TaskState,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

/// File-based store: one JSON document per task and per workflow.
///
/// Layout under the root directory:
/// `tasks/<task_id>.json` and `executions/<encoded workflow_id>.json`.
/// Writes go through a temporary file and a rename so a crash never leaves
/// a half-written record behind.
pub struct FileTaskStore {
    tasks_dir: PathBuf,
    executions_dir: PathBuf,
    // Serializes read-modify-write cycles in `update_state`.
    write_lock: Mutex<()>,
}

impl FileTaskStore {
    /// Use `dir`, creating it if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> ConductorResult<Self> {
        let dir = dir.into();
        let tasks_dir = dir.join("tasks");
        let executions_dir = dir.join("executions");
        tokio::fs::create_dir_all(&tasks_dir).await?;
        tokio::fs::create_dir_all(&executions_dir).await?;
        Ok(Self {
            tasks_dir,
            executions_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.tasks_dir.join(format!("{id}.json"))
    }

    fn execution_path(&self, workflow_id: &str) -> PathBuf {
        self.executions_dir
            .join(format!("{}.json", encode_file_name(workflow_id)))
    }
}

/// Map a workflow id onto a single path component. Bytes outside
/// `[A-Za-z0-9._-]` become `%XX`, so distinct ids never collide.
fn encode_file_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> ConductorResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> ConductorResult<Option<T>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_slice(&data).map_err(|e| {
        ConductorError::Store(format!("Failed to parse {}: {e}", path.display()))
    })?;
    Ok(Some(value))
}

async fn remove(path: &Path) -> ConductorResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn read_all<T: DeserializeOwned>(dir: &Path) -> ConductorResult<Vec<T>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json::<T>(&path).await {
            Ok(Some(value)) => out.push(value),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
        }
    }
    Ok(out)
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn insert_task(&self, record: &TaskRecord) -> ConductorResult<()> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.task_path(record.descriptor.task_id), record).await
    }

    async fn update_state(&self, state: &TaskState) -> ConductorResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.task_path(state.task_id);
        let mut record: TaskRecord = read_json(&path)
            .await?
            .ok_or(ConductorError::TaskNotFound(state.task_id))?;
        record.state = state.clone();
        write_json(&path, &record).await
    }

    async fn get_task(&self, task_id: TaskId) -> ConductorResult<Option<TaskRecord>> {
        read_json(&self.task_path(task_id)).await
    }

    async fn list_tasks(&self) -> ConductorResult<Vec<TaskRecord>> {
        let mut records: Vec<TaskRecord> = read_all(&self.tasks_dir).await?;
        sort_by_submission(&mut records);
        Ok(records)
    }

    async fn delete_task(&self, task_id: TaskId) -> ConductorResult<bool> {
        let _guard = self.write_lock.lock().await;
        remove(&self.task_path(task_id)).await
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> ConductorResult<()> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.execution_path(&record.workflow_id), record).await
    }

    async fn get_execution(&self, workflow_id: &str) -> ConductorResult<Option<ExecutionRecord>> {
        read_json(&self.execution_path(workflow_id)).await
    }

    async fn list_executions(&self) -> ConductorResult<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = read_all(&self.executions_dir).await?;
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    async fn delete_execution(&self, workflow_id: &str) -> ConductorResult<bool> {
        let _guard = self.write_lock.lock().await;
        remove(&self.execution_path(workflow_id)).await
    }
}
