use crate::store::TaskStore;
use async_trait::async_trait;
use conductor_core::{
    ConductorError, ConductorResult, ExecutionRecord, TaskId, TaskRecord, TaskState,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id      TEXT PRIMARY KEY,
    agent_id     TEXT NOT NULL,
    status       TEXT NOT NULL,
    submitted_at TEXT NOT NULL,
    descriptor   TEXT NOT NULL,
    state        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS executions (
    workflow_id TEXT PRIMARY KEY,
    task_id     TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    record      TEXT NOT NULL
);
"#;

/// SQLite-backed store. Rows keep the full records as JSON next to a few
/// indexed columns.
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

fn store_err(e: rusqlite::Error) -> ConductorError {
    ConductorError::Store(format!("SQLite error: {e}"))
}

impl SqliteTaskStore {
    /// Open or create a database file.
    pub fn open(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        Self::with_connection(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> ConductorResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> ConductorResult<Self> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> ConductorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> ConductorResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| ConductorError::Store(format!("SQLite task panicked: {e}")))?
    }
}

fn parse<T: serde::de::DeserializeOwned>(json: &str) -> ConductorResult<T> {
    serde_json::from_str(json)
        .map_err(|e| ConductorError::Store(format!("Failed to parse stored record: {e}")))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_task(&self, record: &TaskRecord) -> ConductorResult<()> {
        let descriptor = serde_json::to_string(&record.descriptor)?;
        let state = serde_json::to_string(&record.state)?;
        let task_id = record.descriptor.task_id.to_string();
        let agent_id = record.descriptor.agent_id.clone();
        let status = record.state.status.to_string();
        let submitted_at = record.descriptor.submitted_at.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tasks (task_id, agent_id, status, submitted_at, descriptor, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![task_id, agent_id, status, submitted_at, descriptor, state],
            )
            .map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn update_state(&self, state: &TaskState) -> ConductorResult<()> {
        let task_id = state.task_id;
        let json = serde_json::to_string(state)?;
        let status = state.status.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE tasks SET status = ?1, state = ?2 WHERE task_id = ?3",
                    params![status, json, task_id.to_string()],
                )
                .map_err(store_err)?;
            if changed == 0 {
                return Err(ConductorError::TaskNotFound(task_id));
            }
            Ok(())
        })
        .await
    }

    async fn get_task(&self, task_id: TaskId) -> ConductorResult<Option<TaskRecord>> {
        let row: Option<(String, String)> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT descriptor, state FROM tasks WHERE task_id = ?1",
                    params![task_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(store_err)
            })
            .await?;
        row.map(|(descriptor, state)| {
            Ok(TaskRecord {
                descriptor: parse(&descriptor)?,
                state: parse(&state)?,
            })
        })
        .transpose()
    }

    async fn list_tasks(&self) -> ConductorResult<Vec<TaskRecord>> {
        let rows: Vec<(String, String)> = self
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT descriptor, state FROM tasks ORDER BY submitted_at, task_id")
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(store_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(store_err)?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|(descriptor, state)| {
                Ok(TaskRecord {
                    descriptor: parse(descriptor)?,
                    state: parse(state)?,
                })
            })
            .collect()
    }

    async fn delete_task(&self, task_id: TaskId) -> ConductorResult<bool> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM tasks WHERE task_id = ?1",
                    params![task_id.to_string()],
                )
                .map_err(store_err)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn save_execution(&self, record: &ExecutionRecord) -> ConductorResult<()> {
        let json = serde_json::to_string(record)?;
        let workflow_id = record.workflow_id.clone();
        let task_id = record.task_id.to_string();
        let started_at = record.started_at.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO executions (workflow_id, task_id, started_at, record)
                 VALUES (?1, ?2, ?3, ?4)",
                params![workflow_id, task_id, started_at, json],
            )
            .map_err(store_err)?;
            Ok(())
        })
        .await
    }

    async fn get_execution(&self, workflow_id: &str) -> ConductorResult<Option<ExecutionRecord>> {
        let workflow_id = workflow_id.to_string();
        let row: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT record FROM executions WHERE workflow_id = ?1",
                    params![workflow_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)
            })
            .await?;
        row.map(|json| parse(&json)).transpose()
    }

    async fn list_executions(&self) -> ConductorResult<Vec<ExecutionRecord>> {
        let rows: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT record FROM executions ORDER BY started_at")
                    .map_err(store_err)?;
                let rows = stmt
                    .query_map([], |row| row.get(0))
                    .map_err(store_err)?
                    .collect::<Result<Vec<String>, _>>()
                    .map_err(store_err)?;
                Ok(rows)
            })
            .await?;
        rows.iter().map(|json| parse(json)).collect()
    }

    async fn delete_execution(&self, workflow_id: &str) -> ConductorResult<bool> {
        let workflow_id = workflow_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM executions WHERE workflow_id = ?1",
                    params![workflow_id],
                )
                .map_err(store_err)?;
            Ok(changed > 0)
        })
        .await
    }
}
