//! SQLite-backed workspace, task, artifact and discovery storage.

use chrono::Utc;
use orbit_core::types::{Task, TaskId, Workspace};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::store::{DiscoveryStore, TaskLister, TaskStore, WorkspaceStore};
use crate::types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },
    #[error("{entity} '{key}' already exists")]
    AlreadyExists { entity: &'static str, key: String },
    #[error("task {task_id} was modified concurrently (expected version {expected})")]
    Conflict { task_id: TaskId, expected: u64 },
}

impl PersistenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistenceError::NotFound { .. } => ErrorKind::NotFound,
            PersistenceError::AlreadyExists { .. } | PersistenceError::Conflict { .. } => {
                ErrorKind::Precondition
            }
            PersistenceError::Sql { .. }
            | PersistenceError::Json { .. }
            | PersistenceError::CreateDir { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PersistenceError::NotFound { .. })
    }
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating parent directories) and migrate.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS workspaces (
    name TEXT PRIMARY KEY,
    status_tag TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    workspace TEXT NOT NULL,
    task_id TEXT NOT NULL,
    status_tag TEXT NOT NULL,
    version INTEGER NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (workspace, task_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status_tag);

CREATE TABLE IF NOT EXISTS artifacts (
    workspace TEXT NOT NULL,
    task_id TEXT NOT NULL,
    name TEXT NOT NULL,
    content BLOB NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (workspace, task_id, name)
);

CREATE TABLE IF NOT EXISTS discoveries (
    discovery_id TEXT PRIMARY KEY,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#,
        )?;
        Ok(())
    }

    /// Record a backlog item that tasks may reference via `from_backlog_id`.
    pub fn upsert_discovery(
        &self,
        id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(payload)?;
        self.conn.execute(
            r#"
INSERT INTO discoveries (discovery_id, payload_json, created_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(discovery_id) DO UPDATE SET payload_json = excluded.payload_json
"#,
            params![id, payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn discovery_exists(&self, id: &str) -> Result<bool, PersistenceError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM discoveries WHERE discovery_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn task_version(&self, workspace: &str, id: &TaskId) -> Result<Option<u64>, PersistenceError> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM tasks WHERE workspace = ?1 AND task_id = ?2",
                params![workspace, id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }
}

fn decode_task(payload: &str, version: i64) -> Result<Task, PersistenceError> {
    let mut task: Task = serde_json::from_str(payload)?;
    // The column is authoritative.
    task.version = version as u64;
    Ok(task)
}

fn workspace_not_found(name: &str) -> PersistenceError {
    PersistenceError::NotFound {
        entity: "workspace",
        key: name.to_string(),
    }
}

fn task_key(workspace: &str, id: &TaskId) -> String {
    format!("{workspace}/{id}")
}

impl WorkspaceStore for SqliteStore {
    fn create_workspace(&self, workspace: &Workspace) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(workspace)?;
        let inserted = self.conn.execute(
            r#"
INSERT OR IGNORE INTO workspaces (name, status_tag, payload_json, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            params![
                workspace.name,
                workspace.status.as_str(),
                payload,
                workspace.created_at.to_rfc3339(),
                workspace.updated_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(PersistenceError::AlreadyExists {
                entity: "workspace",
                key: workspace.name.clone(),
            });
        }
        Ok(())
    }

    fn get_workspace(&self, name: &str) -> Result<Workspace, PersistenceError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM workspaces WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let payload = payload.ok_or_else(|| workspace_not_found(name))?;
        Ok(serde_json::from_str(&payload)?)
    }

    fn update_workspace(&self, workspace: &Workspace) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(workspace)?;
        let updated = self.conn.execute(
            r#"
UPDATE workspaces SET status_tag = ?2, payload_json = ?3, updated_at = ?4
WHERE name = ?1
"#,
            params![
                workspace.name,
                workspace.status.as_str(),
                payload,
                workspace.updated_at.to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(workspace_not_found(&workspace.name));
        }
        Ok(())
    }

    fn workspace_exists(&self, name: &str) -> Result<bool, PersistenceError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM workspaces WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn list_workspaces(&self) -> Result<Vec<Workspace>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM workspaces ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut workspaces = Vec::new();
        for row in rows {
            let payload = row?;
            workspaces.push(serde_json::from_str::<Workspace>(&payload)?);
        }
        Ok(workspaces)
    }

    fn delete_workspace(&self, name: &str) -> Result<bool, PersistenceError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM artifacts WHERE workspace = ?1", params![name])?;
        tx.execute("DELETE FROM tasks WHERE workspace = ?1", params![name])?;
        let removed = tx.execute("DELETE FROM workspaces WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

impl TaskLister for SqliteStore {
    fn list_tasks(&self, workspace: &str) -> Result<Vec<Task>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json, version FROM tasks WHERE workspace = ?1 ORDER BY created_at ASC, task_id ASC",
        )?;
        let rows = stmt.query_map(params![workspace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            let (payload, version) = row?;
            tasks.push(decode_task(&payload, version)?);
        }
        Ok(tasks)
    }
}

impl TaskStore for SqliteStore {
    fn create_task(&self, task: &Task) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(task)?;
        let inserted = self.conn.execute(
            r#"
INSERT OR IGNORE INTO tasks (workspace, task_id, status_tag, version, payload_json, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#,
            params![
                task.workspace,
                task.id.0,
                task.status.as_str(),
                task.version as i64,
                payload,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(PersistenceError::AlreadyExists {
                entity: "task",
                key: task_key(&task.workspace, &task.id),
            });
        }
        Ok(())
    }

    fn get_task(&self, workspace: &str, id: &TaskId) -> Result<Task, PersistenceError> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT payload_json, version FROM tasks WHERE workspace = ?1 AND task_id = ?2",
                params![workspace, id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (payload, version) = row.ok_or_else(|| PersistenceError::NotFound {
            entity: "task",
            key: task_key(workspace, id),
        })?;
        decode_task(&payload, version)
    }

    fn update_task(&self, task: &Task) -> Result<u64, PersistenceError> {
        let next_version = task.version + 1;
        let mut stored = task.clone();
        stored.version = next_version;
        let payload = serde_json::to_string(&stored)?;
        let updated = self.conn.execute(
            r#"
UPDATE tasks SET status_tag = ?3, version = ?4, payload_json = ?5, updated_at = ?6
WHERE workspace = ?1 AND task_id = ?2 AND version = ?7
"#,
            params![
                task.workspace,
                task.id.0,
                task.status.as_str(),
                next_version as i64,
                payload,
                task.updated_at.to_rfc3339(),
                task.version as i64,
            ],
        )?;
        if updated == 0 {
            return match self.task_version(&task.workspace, &task.id)? {
                Some(_) => Err(PersistenceError::Conflict {
                    task_id: task.id.clone(),
                    expected: task.version,
                }),
                None => Err(PersistenceError::NotFound {
                    entity: "task",
                    key: task_key(&task.workspace, &task.id),
                }),
            };
        }
        Ok(next_version)
    }

    fn save_artifact(
        &self,
        workspace: &str,
        task_id: &TaskId,
        name: &str,
        content: &[u8],
    ) -> Result<(), PersistenceError> {
        if self.task_version(workspace, task_id)?.is_none() {
            return Err(PersistenceError::NotFound {
                entity: "task",
                key: task_key(workspace, task_id),
            });
        }
        self.conn.execute(
            r#"
INSERT INTO artifacts (workspace, task_id, name, content, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(workspace, task_id, name) DO UPDATE SET
  content = excluded.content,
  updated_at = excluded.updated_at
"#,
            params![workspace, task_id.0, name, content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn get_artifact(
        &self,
        workspace: &str,
        task_id: &TaskId,
        name: &str,
    ) -> Result<Vec<u8>, PersistenceError> {
        let content: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT content FROM artifacts WHERE workspace = ?1 AND task_id = ?2 AND name = ?3",
                params![workspace, task_id.0, name],
                |row| row.get(0),
            )
            .optional()?;
        content.ok_or_else(|| PersistenceError::NotFound {
            entity: "artifact",
            key: format!("{}/{name}", task_key(workspace, task_id)),
        })
    }
}

impl DiscoveryStore for SqliteStore {
    fn delete_discovery(&self, id: &str) -> Result<bool, PersistenceError> {
        let removed = self.conn.execute(
            "DELETE FROM discoveries WHERE discovery_id = ?1",
            params![id],
        )?;
        Ok(removed > 0)
    }
}
