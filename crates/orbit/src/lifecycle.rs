//! Workspace lifecycle: create, close, retire, destroy.
//!
//! Close and retire remove the worktree but keep the branch; both refuse while
//! a task is executing. Destroy always removes local state; git failures only
//! produce warnings with the manual cleanup command.

use chrono::Utc;
use orbit_core::state::WorkspaceStatus;
use orbit_core::types::{meta, TaskId, Workspace};
use orbit_core::validation::{has_errors, Validate, WorkspaceName};
use orbit_git::{GitError, WorktreeRunner};
use std::path::PathBuf;

use crate::cancel::{CancelToken, Cancelled};
use crate::persistence::PersistenceError;
use crate::store::{DiscoveryStore, TaskLister, WorkspaceStore};
use crate::transition_log::JsonlTransitionLog;
use crate::types::{BestEffortAction, BestEffortFailure, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("workspace '{0}' not found")]
    WorkspaceNotFound(String),
    #[error("workspace '{workspace}' has running tasks: {}", format_ids(.task_ids))]
    HasRunningTasks {
        workspace: String,
        task_ids: Vec<TaskId>,
    },
    #[error(
        "workspace '{workspace}': git is unavailable, cannot remove worktree {}",
        .path.display()
    )]
    GitUnavailable { workspace: String, path: PathBuf },
    #[error("workspace '{workspace}': {source}")]
    Git {
        workspace: String,
        #[source]
        source: GitError,
    },
    #[error("invalid workspace name '{name}': {message}")]
    InvalidName { name: String, message: String },
    #[error(transparent)]
    Store(#[from] PersistenceError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::WorkspaceNotFound(_) => ErrorKind::NotFound,
            LifecycleError::HasRunningTasks { .. } => ErrorKind::Precondition,
            LifecycleError::GitUnavailable { .. } | LifecycleError::Git { .. } => {
                ErrorKind::External
            }
            LifecycleError::InvalidName { .. } => ErrorKind::Validation,
            LifecycleError::Store(err) => err.kind(),
            LifecycleError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

fn format_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseResult {
    pub workspace: Workspace,
    /// The workspace was already in the requested state; nothing changed.
    pub already_in_state: bool,
    pub removed_worktree: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyResult {
    pub workspace: String,
    pub removed_tasks: usize,
    /// Git cleanup that did not happen, with the command to finish it by hand.
    pub warnings: Vec<String>,
    pub diagnostics: Vec<BestEffortFailure>,
}

pub struct WorkspaceManager<'a> {
    workspaces: &'a dyn WorkspaceStore,
    tasks: &'a dyn TaskLister,
    runner: Option<&'a dyn WorktreeRunner>,
    discoveries: Option<&'a dyn DiscoveryStore>,
    log: Option<&'a JsonlTransitionLog>,
}

impl<'a> WorkspaceManager<'a> {
    pub fn new(
        workspaces: &'a dyn WorkspaceStore,
        tasks: &'a dyn TaskLister,
        runner: Option<&'a dyn WorktreeRunner>,
    ) -> Self {
        Self {
            workspaces,
            tasks,
            runner,
            discoveries: None,
            log: None,
        }
    }

    pub fn with_discoveries(mut self, discoveries: &'a dyn DiscoveryStore) -> Self {
        self.discoveries = Some(discoveries);
        self
    }

    pub fn with_log(mut self, log: &'a JsonlTransitionLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Register a new active workspace, checking out `branch` into a fresh
    /// worktree when git is available.
    pub fn create(
        &self,
        ctx: &CancelToken,
        name: &str,
        branch: &str,
    ) -> Result<Workspace, LifecycleError> {
        ctx.check()?;
        let issues = WorkspaceName(name).validate();
        if has_errors(&issues) {
            let message = issues
                .iter()
                .map(|issue| issue.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(LifecycleError::InvalidName {
                name: name.to_string(),
                message,
            });
        }
        if self.workspaces.workspace_exists(name)? {
            return Err(PersistenceError::AlreadyExists {
                entity: "workspace",
                key: name.to_string(),
            }
            .into());
        }

        let worktree_path = match self.runner {
            Some(runner) => {
                let path = runner.worktree_path(name);
                ctx.check()?;
                runner
                    .add_worktree(&path, branch)
                    .map_err(|source| git_error(name, source))?;
                Some(path)
            }
            None => {
                tracing::warn!(workspace = name, "no git repository; workspace has no worktree");
                None
            }
        };

        let workspace = Workspace::new(name, branch, worktree_path, Utc::now());
        self.workspaces.create_workspace(&workspace)?;
        tracing::info!(workspace = name, branch, "workspace created");
        Ok(workspace)
    }

    pub fn get(&self, name: &str) -> Result<Workspace, LifecycleError> {
        self.workspaces.get_workspace(name).map_err(|err| {
            if err.is_not_found() {
                LifecycleError::WorkspaceNotFound(name.to_string())
            } else {
                LifecycleError::Store(err)
            }
        })
    }

    pub fn list(&self) -> Result<Vec<Workspace>, LifecycleError> {
        Ok(self.workspaces.list_workspaces()?)
    }

    pub fn close(&self, ctx: &CancelToken, name: &str) -> Result<CloseResult, LifecycleError> {
        self.archive(ctx, name, WorkspaceStatus::Closed)
    }

    pub fn retire(&self, ctx: &CancelToken, name: &str) -> Result<CloseResult, LifecycleError> {
        self.archive(ctx, name, WorkspaceStatus::Retired)
    }

    pub fn update_status(
        &self,
        ctx: &CancelToken,
        name: &str,
        status: WorkspaceStatus,
    ) -> Result<Workspace, LifecycleError> {
        ctx.check()?;
        let mut workspace = self.get(name)?;
        if workspace.status != status {
            let from = workspace.status;
            workspace.status = status;
            workspace.updated_at = Utc::now();
            self.workspaces.update_workspace(&workspace)?;
            tracing::info!(workspace = name, from = %from, to = %status, "workspace status changed");
        }
        Ok(workspace)
    }

    /// Pause an active workspace after one of its tasks was abandoned.
    /// Archived or already paused workspaces are left alone.
    pub fn pause(&self, ctx: &CancelToken, name: &str) -> Result<Workspace, LifecycleError> {
        let workspace = self.get(name)?;
        if workspace.status != WorkspaceStatus::Active {
            return Ok(workspace);
        }
        self.update_status(ctx, name, WorkspaceStatus::Paused)
    }

    pub fn destroy(&self, ctx: &CancelToken, name: &str) -> Result<DestroyResult, LifecycleError> {
        ctx.check()?;
        let workspace = self.get(name)?;
        let mut warnings = Vec::new();
        let mut diagnostics = Vec::new();

        let tasks = match self.tasks.list_tasks(name) {
            Ok(tasks) => tasks,
            Err(err) => {
                diagnostics.push(BestEffortFailure::record(
                    BestEffortAction::DeleteDiscovery,
                    format!("could not list tasks to find linked discoveries: {err}"),
                ));
                Vec::new()
            }
        };

        if let Some(path) = workspace.worktree_path.as_ref().filter(|p| p.exists()) {
            let manual = format!("git worktree remove --force {}", path.display());
            match self.runner {
                Some(runner) => {
                    if let Err(err) = runner.remove_worktree(path, true) {
                        warnings.push(format!("failed to remove worktree: {err}; run `{manual}`"));
                    }
                }
                None => warnings.push(format!("git unavailable; run `{manual}`")),
            }
        }

        let manual = format!("git branch -D {}", workspace.branch);
        match self.runner {
            Some(runner) => {
                if let Err(err) = runner.delete_branch(&workspace.branch, true) {
                    warnings.push(format!("failed to delete branch: {err}; run `{manual}`"));
                }
            }
            None => warnings.push(format!("git unavailable; run `{manual}`")),
        }

        self.workspaces.delete_workspace(name)?;

        if let Some(log) = self.log {
            if let Err(err) = log.remove_workspace(name) {
                diagnostics.push(BestEffortFailure::record(
                    BestEffortAction::RemoveTransitionLog,
                    format!("{}: {err}", log.workspace_dir(name).display()),
                ));
            }
        }

        if let Some(discoveries) = self.discoveries {
            for backlog_id in tasks.iter().filter_map(|task| task.meta(meta::FROM_BACKLOG_ID)) {
                match discoveries.delete_discovery(backlog_id) {
                    Ok(removed) => {
                        tracing::debug!(workspace = name, backlog_id, removed, "discovery cleanup")
                    }
                    Err(err) => diagnostics.push(BestEffortFailure::record(
                        BestEffortAction::DeleteDiscovery,
                        format!("discovery {backlog_id}: {err}"),
                    )),
                }
            }
        }

        for warning in &warnings {
            tracing::warn!(workspace = name, "{warning}");
        }
        tracing::info!(workspace = name, tasks = tasks.len(), "workspace destroyed");
        Ok(DestroyResult {
            workspace: name.to_string(),
            removed_tasks: tasks.len(),
            warnings,
            diagnostics,
        })
    }

    fn archive(
        &self,
        ctx: &CancelToken,
        name: &str,
        target: WorkspaceStatus,
    ) -> Result<CloseResult, LifecycleError> {
        ctx.check()?;
        let mut workspace = self.get(name)?;
        if workspace.status == target {
            return Ok(CloseResult {
                workspace,
                already_in_state: true,
                removed_worktree: None,
            });
        }
        self.ensure_no_running_tasks(name)?;

        let mut removed_worktree = None;
        if let Some(path) = workspace.worktree_path.clone().filter(|p| p.exists()) {
            let runner = self.runner.ok_or_else(|| LifecycleError::GitUnavailable {
                workspace: name.to_string(),
                path: path.clone(),
            })?;
            ctx.check()?;
            runner
                .remove_worktree(&path, false)
                .map_err(|source| git_error(name, source))?;
            removed_worktree = Some(path);
        }

        workspace.worktree_path = None;
        workspace.status = target;
        workspace.updated_at = Utc::now();
        self.workspaces.update_workspace(&workspace)?;
        tracing::info!(workspace = name, status = %target, "workspace archived");
        Ok(CloseResult {
            workspace,
            already_in_state: false,
            removed_worktree,
        })
    }

    fn ensure_no_running_tasks(&self, name: &str) -> Result<(), LifecycleError> {
        let task_ids = self
            .tasks
            .list_tasks(name)?
            .into_iter()
            .filter(|task| task.status.is_executing())
            .map(|task| task.id)
            .collect::<Vec<_>>();
        if task_ids.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::HasRunningTasks {
                workspace: name.to_string(),
                task_ids,
            })
        }
    }
}

fn git_error(workspace: &str, source: GitError) -> LifecycleError {
    LifecycleError::Git {
        workspace: workspace.to_string(),
        source,
    }
}
