//! Task and workspace status enums.
//!
//! The predicates here are the single source of truth for which statuses are
//! terminal, which are recoverable errors, and which mean a worktree is in use.

use serde::{Deserialize, Serialize};

/// Execution status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet started.
    Pending,
    /// An agent is executing pipeline steps in the worktree.
    Running,
    /// Validation commands are executing.
    Validating,
    /// Validation reported failures.
    ValidationFailed,
    /// Waiting for a human to approve or reject.
    AwaitingApproval,
    Completed,
    Rejected,
    Abandoned,
    /// Pushing or opening the pull request failed.
    GhFailed,
    CiFailed,
    /// CI did not report within the polling window.
    CiTimeout,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 11] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Validating,
        TaskStatus::ValidationFailed,
        TaskStatus::AwaitingApproval,
        TaskStatus::Completed,
        TaskStatus::Rejected,
        TaskStatus::Abandoned,
        TaskStatus::GhFailed,
        TaskStatus::CiFailed,
        TaskStatus::CiTimeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Validating => "validating",
            TaskStatus::ValidationFailed => "validation_failed",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Completed => "completed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Abandoned => "abandoned",
            TaskStatus::GhFailed => "gh_failed",
            TaskStatus::CiFailed => "ci_failed",
            TaskStatus::CiTimeout => "ci_timeout",
        }
    }

    /// No operation may move a task out of a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Rejected | TaskStatus::Abandoned
        )
    }

    /// Recoverable failure states.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            TaskStatus::ValidationFailed
                | TaskStatus::GhFailed
                | TaskStatus::CiFailed
                | TaskStatus::CiTimeout
        )
    }

    /// States in which the worktree is actively being written to.
    pub fn is_executing(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Validating)
    }
}

/// Returns true for the four recoverable error states.
pub fn is_error_status(status: TaskStatus) -> bool {
    status.is_error()
}

/// Plain (non-forced) abandonment is only legal from an error state.
pub fn can_abandon(status: TaskStatus) -> bool {
    status.is_error()
}

/// Forced abandonment additionally covers a task that is still running.
pub fn can_force_abandon(status: TaskStatus) -> bool {
    status.is_error() || status == TaskStatus::Running
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| {
                let valid = TaskStatus::ALL
                    .iter()
                    .map(|status| status.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("invalid task status '{value}'. valid values: {valid}")
            })
    }
}

/// Lifecycle status of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    Active,
    /// A task was abandoned; branch and worktree kept for manual work.
    Paused,
    /// Work is done; worktree removed, branch kept.
    Closed,
    /// Archived; worktree removed, branch kept.
    Retired,
}

impl WorkspaceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Paused => "paused",
            WorkspaceStatus::Closed => "closed",
            WorkspaceStatus::Retired => "retired",
        }
    }

    /// Closed and retired workspaces no longer have a worktree.
    pub fn is_archived(self) -> bool {
        matches!(self, WorkspaceStatus::Closed | WorkspaceStatus::Retired)
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "active" => Ok(WorkspaceStatus::Active),
            "paused" => Ok(WorkspaceStatus::Paused),
            "closed" => Ok(WorkspaceStatus::Closed),
            "retired" => Ok(WorkspaceStatus::Retired),
            other => Err(format!(
                "invalid workspace status '{other}'. valid values: active, paused, closed, retired"
            )),
        }
    }
}
