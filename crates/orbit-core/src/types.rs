//! Core records persisted by orbit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::state::{TaskStatus, WorkspaceStatus};

/// Well-known task metadata keys.
pub mod meta {
    /// Classified cause of a failed push (see `PushErrorType`).
    pub const PUSH_ERROR_TYPE: &str = "push_error_type";
    pub const CI_URL: &str = "ci_url";
    pub const REJECTION_FEEDBACK: &str = "rejection_feedback";
    /// 0-indexed step a rejected task resumes at.
    pub const REJECTION_STEP: &str = "rejection_step";
    /// Pid of the agent process executing the task.
    pub const AGENT_PID: &str = "agent_pid";
    pub const FROM_BACKLOG_ID: &str = "from_backlog_id";
    pub const LAST_ERROR: &str = "last_error";
}

/// Well-known artifact names.
pub mod artifact {
    pub const REJECTION_FEEDBACK: &str = "rejection-feedback.md";
    pub const VALIDATION: &str = "validation.json";
}

pub const TASK_ID_PREFIX: &str = "task-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds a `task-YYYYMMDD-HHMMSS` id for `at`, appending `-N` when the
    /// base id is already taken by one of `existing`.
    pub fn generate(at: DateTime<Utc>, existing: &[TaskId]) -> Self {
        let base = format!("{TASK_ID_PREFIX}{}", at.format("%Y%m%d-%H%M%S"));
        if !existing.iter().any(|id| id.0 == base) {
            return Self(base);
        }
        let mut suffix = 2;
        loop {
            let candidate = format!("{base}-{suffix}");
            if !existing.iter().any(|id| id.0 == candidate) {
                return Self(candidate);
            }
            suffix += 1;
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Classified cause of a failed `git push`, stored under
/// `meta::PUSH_ERROR_TYPE` by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushErrorType {
    /// Remote branch moved; a rebase is needed before pushing again.
    NonFastForward,
    AuthFailed,
    Network,
}

impl PushErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            PushErrorType::NonFastForward => "non_fast_forward",
            PushErrorType::AuthFailed => "auth_failed",
            PushErrorType::Network => "network",
        }
    }

    /// Returns `None` for values this version does not recognize.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "non_fast_forward" => Some(PushErrorType::NonFastForward),
            "auth_failed" => Some(PushErrorType::AuthFailed),
            "network" => Some(PushErrorType::Network),
            _ => None,
        }
    }
}

impl std::fmt::Display for PushErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One entry of a task's append-only status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workspace: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, managed by the task store.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Create a new task in Pending state.
    pub fn new(id: TaskId, workspace: impl Into<String>, steps: Vec<Step>, at: DateTime<Utc>) -> Self {
        Self {
            id,
            workspace: workspace.into(),
            status: TaskStatus::Pending,
            current_step: 0,
            steps,
            transitions: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: at,
            updated_at: at,
            version: 0,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn current_step_name(&self) -> Option<&str> {
        self.steps.get(self.current_step).map(|step| step.name.as_str())
    }

    pub fn push_error_type(&self) -> Option<PushErrorType> {
        self.meta(meta::PUSH_ERROR_TYPE).and_then(PushErrorType::parse)
    }

    pub fn agent_pid(&self) -> Option<u32> {
        self.meta(meta::AGENT_PID)
            .and_then(|raw| raw.trim().parse::<u32>().ok())
    }

    pub fn as_ref_entry(&self) -> TaskRef {
        TaskRef {
            id: self.id.clone(),
            status: self.status,
            started_at: self.created_at,
        }
    }
}

/// Returns the most recently created task, ties broken by id.
pub fn latest_task(tasks: &[Task]) -> Option<&Task> {
    tasks
        .iter()
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
}

/// Listing cache entry on a workspace. May lag the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: TaskId,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    /// `None` once the worktree has been removed.
    pub worktree_path: Option<PathBuf>,
    pub branch: String,
    #[serde(default)]
    pub status: WorkspaceStatus,
    #[serde(default)]
    pub tasks: Vec<TaskRef>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(
        name: impl Into<String>,
        branch: impl Into<String>,
        worktree_path: Option<PathBuf>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            worktree_path,
            branch: branch.into(),
            status: WorkspaceStatus::Active,
            tasks: Vec::new(),
            metadata: BTreeMap::new(),
            created_at: at,
            updated_at: at,
        }
    }

    /// Insert or refresh the cached entry for `task`.
    pub fn sync_task_ref(&mut self, task: &Task) {
        let entry = task.as_ref_entry();
        match self.tasks.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.tasks.push(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn task_id_uses_timestamp_format() {
        let id = TaskId::generate(at(9, 5, 7), &[]);
        assert_eq!(id.0, "task-20260314-090507");
    }

    #[test]
    fn task_id_suffixes_collisions_within_same_second() {
        let existing = vec![
            TaskId::new("task-20260314-090507"),
            TaskId::new("task-20260314-090507-2"),
        ];
        let id = TaskId::generate(at(9, 5, 7), &existing);
        assert_eq!(id.0, "task-20260314-090507-3");
    }

    #[test]
    fn task_ids_sort_in_creation_order() {
        let earlier = TaskId::generate(at(9, 5, 7), &[]);
        let later = TaskId::generate(at(10, 0, 0), &[]);
        assert!(earlier < later);
    }

    #[test]
    fn new_task_starts_pending_at_step_zero() {
        let task = Task::new(
            TaskId::new("task-1"),
            "auth",
            vec![Step::new("analyze"), Step::new("implement")],
            at(1, 0, 0),
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.current_step, 0);
        assert_eq!(task.current_step_name(), Some("analyze"));
        assert!(task.transitions.is_empty());
        assert_eq!(task.version, 0);
    }

    #[test]
    fn push_error_type_reads_metadata_and_ignores_unknown_values() {
        let task = Task::new(TaskId::new("t"), "ws", Vec::new(), at(1, 0, 0))
            .with_metadata(meta::PUSH_ERROR_TYPE, "non-fast-forward");
        assert_eq!(task.push_error_type(), Some(PushErrorType::NonFastForward));

        let task = task.with_metadata(meta::PUSH_ERROR_TYPE, "quota");
        assert_eq!(task.push_error_type(), None);
    }

    #[test]
    fn agent_pid_requires_numeric_value() {
        let task = Task::new(TaskId::new("t"), "ws", Vec::new(), at(1, 0, 0))
            .with_metadata(meta::AGENT_PID, " 4242 ");
        assert_eq!(task.agent_pid(), Some(4242));

        let task = task.with_metadata(meta::AGENT_PID, "abc");
        assert_eq!(task.agent_pid(), None);
    }

    #[test]
    fn latest_task_prefers_created_at_then_id() {
        let a = Task::new(TaskId::new("task-a"), "ws", Vec::new(), at(1, 0, 0));
        let b = Task::new(TaskId::new("task-b"), "ws", Vec::new(), at(2, 0, 0));
        let c = Task::new(TaskId::new("task-c"), "ws", Vec::new(), at(2, 0, 0));
        let tasks = vec![b, a, c];
        assert_eq!(latest_task(&tasks).unwrap().id.0, "task-c");
        assert!(latest_task(&[]).is_none());
    }

    #[test]
    fn sync_task_ref_replaces_existing_entry() {
        let mut ws = Workspace::new("auth", "orbit/auth", None, at(1, 0, 0));
        let mut task = Task::new(TaskId::new("task-1"), "auth", Vec::new(), at(1, 0, 0));
        ws.sync_task_ref(&task);
        task.status = TaskStatus::Running;
        ws.sync_task_ref(&task);

        assert_eq!(ws.tasks.len(), 1);
        assert_eq!(ws.tasks[0].status, TaskStatus::Running);
    }

    #[test]
    fn workspace_deserializes_with_defaults() {
        let ws: Workspace = serde_json::from_str(
            r#"{
                "name": "auth",
                "worktree_path": null,
                "branch": "orbit/auth",
                "created_at": "2026-03-14T01:00:00Z",
                "updated_at": "2026-03-14T01:00:00Z"
            }"#,
        )
        .expect("deserialize workspace");
        assert_eq!(ws.status, WorkspaceStatus::Active);
        assert!(ws.tasks.is_empty());
        assert!(ws.metadata.is_empty());
    }
}
