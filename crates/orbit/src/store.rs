//! Storage ports the engine, lifecycle manager and recovery paths depend on.
//!
//! Stores give read-your-writes within one process and nothing across
//! processes. Task updates are version-checked; workspace updates are
//! last-writer-wins.

use orbit_core::types::{Task, TaskId, Workspace};

use crate::persistence::PersistenceError;

pub trait WorkspaceStore {
    /// Fails with `AlreadyExists` if the name is taken.
    fn create_workspace(&self, workspace: &Workspace) -> Result<(), PersistenceError>;
    fn get_workspace(&self, name: &str) -> Result<Workspace, PersistenceError>;
    fn update_workspace(&self, workspace: &Workspace) -> Result<(), PersistenceError>;
    fn workspace_exists(&self, name: &str) -> Result<bool, PersistenceError>;
    fn list_workspaces(&self) -> Result<Vec<Workspace>, PersistenceError>;
    /// Removes the workspace and everything nested under it (tasks, their
    /// transition history, artifacts). Returns whether the workspace existed.
    fn delete_workspace(&self, name: &str) -> Result<bool, PersistenceError>;
}

/// Read access to the authoritative task records of one workspace.
pub trait TaskLister {
    /// Order is unspecified; use `orbit_core::latest_task` for "latest".
    fn list_tasks(&self, workspace: &str) -> Result<Vec<Task>, PersistenceError>;
}

pub trait TaskStore: TaskLister {
    fn create_task(&self, task: &Task) -> Result<(), PersistenceError>;
    fn get_task(&self, workspace: &str, id: &TaskId) -> Result<Task, PersistenceError>;
    /// Writes `task` if the stored version still equals `task.version` and
    /// returns the new version. A stale write fails with `Conflict`.
    fn update_task(&self, task: &Task) -> Result<u64, PersistenceError>;
    /// Later writes of the same name overwrite earlier ones.
    fn save_artifact(
        &self,
        workspace: &str,
        task_id: &TaskId,
        name: &str,
        content: &[u8],
    ) -> Result<(), PersistenceError>;
    fn get_artifact(
        &self,
        workspace: &str,
        task_id: &TaskId,
        name: &str,
    ) -> Result<Vec<u8>, PersistenceError>;
}

/// Linkage into the backlog/discovery subsystem.
pub trait DiscoveryStore {
    /// Returns whether a record was removed.
    fn delete_discovery(&self, id: &str) -> Result<bool, PersistenceError>;
}
