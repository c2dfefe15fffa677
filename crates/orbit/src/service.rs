//! Orbit service.
//!
//! Resolves a workspace and its latest task from the stores, runs the
//! requested operation through the engine, lifecycle manager or recovery
//! orchestrator, and keeps the workspace's task cache in step.

use chrono::Utc;
use orbit_core::config::OrbitConfig;
use orbit_core::state::{TaskStatus, WorkspaceStatus};
use orbit_core::types::{latest_task, meta, Step, Task, TaskId, Workspace};
use orbit_core::validation::{has_errors, Validate, ValidationLevel};
use orbit_git::{GitCli, GitWorktreeRunner, WorktreeRunner};
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::confirm::{ConfirmError, Confirmer};
use crate::engine::{EngineError, TaskEngine, TransitionOutcome};
use crate::lifecycle::{CloseResult, DestroyResult, LifecycleError, WorkspaceManager};
use crate::persistence::{PersistenceError, SqliteStore};
use crate::process::{ProcessTerminator, SignalTerminator};
use crate::recovery::{RecoveryAction, RecoveryError, RecoveryOrchestrator, RecoveryOutcome};
use crate::state_machine::is_reported_transition;
use crate::store::{TaskLister, TaskStore, WorkspaceStore};
use crate::transition_log::JsonlTransitionLog;
use crate::types::{BestEffortAction, BestEffortFailure, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("workspace '{workspace}' has no tasks")]
    NoTasks { workspace: String },
    #[error("workspace '{workspace}' is {status}; destroy it or pick another name")]
    WorkspaceArchived {
        workspace: String,
        status: WorkspaceStatus,
    },
    #[error("workspace '{workspace}' already has task {task_id} in status {status}")]
    TaskInProgress {
        workspace: String,
        task_id: TaskId,
        status: TaskStatus,
    },
    #[error("task {task_id} status {status} is not an error state; nothing to resume")]
    NothingToResume { task_id: TaskId, status: TaskStatus },
    #[error(
        "invalid transition: task {task_id} cannot be set from {from} to {to}; \
         use abandon, approve, reject or recover"
    )]
    NotReportable {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("{action} of workspace '{workspace}' needs confirmation; rerun with --force")]
    ConfirmationRequired {
        action: &'static str,
        workspace: String,
    },
    #[error("failed to read confirmation: {0}")]
    Prompt(#[from] ConfirmError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidConfig(_) => ErrorKind::Validation,
            ServiceError::Persistence(err) => err.kind(),
            ServiceError::Engine(err) => err.kind(),
            ServiceError::Lifecycle(err) => err.kind(),
            ServiceError::Recovery(err) => err.kind(),
            ServiceError::NoTasks { .. } => ErrorKind::NotFound,
            ServiceError::NotReportable { .. } => ErrorKind::InvalidTransition,
            ServiceError::WorkspaceArchived { .. }
            | ServiceError::TaskInProgress { .. }
            | ServiceError::NothingToResume { .. } => ErrorKind::Precondition,
            ServiceError::ConfirmationRequired { .. } => ErrorKind::ConfirmationRequired,
            ServiceError::Prompt(_) => ErrorKind::Internal,
        }
    }
}

/// A task after a successful operation, plus best-effort failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: Task,
    pub diagnostics: Vec<BestEffortFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverReport {
    pub task: Task,
    pub outcome: RecoveryOutcome,
    pub diagnostics: Vec<BestEffortFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSummary {
    pub workspace: Workspace,
    /// Read from the task store, never from the workspace cache.
    pub latest: Option<Task>,
    pub task_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectMode {
    Done { feedback: Option<String> },
    Retry { feedback: String, step: Option<i64> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Empty means the configured default pipeline.
    pub steps: Vec<String>,
    pub agent_pid: Option<u32>,
    pub backlog_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub reason: Option<String>,
    pub push_error_type: Option<String>,
    pub ci_url: Option<String>,
}

pub struct OrbitService {
    pub config: OrbitConfig,
    pub store: SqliteStore,
    pub log: JsonlTransitionLog,
    runner: Option<Box<dyn WorktreeRunner>>,
    terminator: Box<dyn ProcessTerminator>,
}

impl OrbitService {
    pub fn new(
        config: OrbitConfig,
        store: SqliteStore,
        log: JsonlTransitionLog,
        runner: Option<Box<dyn WorktreeRunner>>,
        terminator: Box<dyn ProcessTerminator>,
    ) -> Self {
        Self {
            config,
            store,
            log,
            runner,
            terminator,
        }
    }

    /// Open state under `base_dir`. Relative config paths resolve against the
    /// enclosing repository root when there is one, `base_dir` otherwise.
    pub fn open(config: OrbitConfig, base_dir: &Path) -> Result<Self, ServiceError> {
        let issues = config.validate();
        for issue in issues
            .iter()
            .filter(|issue| issue.level == ValidationLevel::Warning)
        {
            tracing::warn!(code = issue.code, "{}", issue.message);
        }
        if has_errors(&issues) {
            let message = issues
                .iter()
                .filter(|issue| issue.level == ValidationLevel::Error)
                .map(|issue| format!("{}: {}", issue.code, issue.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ServiceError::InvalidConfig(message));
        }

        let git = GitCli::new(&config.git.binary);
        let runner =
            match GitWorktreeRunner::discover(base_dir, git, &config.git.worktree_root) {
                Ok(runner) => runner,
                Err(err) => {
                    tracing::warn!("git unavailable, continuing without worktrees: {err}");
                    None
                }
            };
        let root = runner
            .as_ref()
            .map(|runner| runner.repo().root.clone())
            .unwrap_or_else(|| base_dir.to_path_buf());
        if runner.is_none() {
            tracing::info!(root = %root.display(), "no git repository detected");
        }

        let store = SqliteStore::open(resolve(&root, &config.storage.state_path))?;
        let log = JsonlTransitionLog::new(resolve(&root, &config.storage.transition_log_root));
        let runner = runner.map(|runner| Box::new(runner) as Box<dyn WorktreeRunner>);
        Ok(Self::new(
            config,
            store,
            log,
            runner,
            Box::new(SignalTerminator),
        ))
    }

    pub fn has_git(&self) -> bool {
        self.runner.is_some()
    }

    fn engine(&self) -> TaskEngine<'_> {
        TaskEngine::new(&self.store, self.terminator.as_ref()).with_log(&self.log)
    }

    fn manager(&self) -> WorkspaceManager<'_> {
        WorkspaceManager::new(&self.store, &self.store, self.runner.as_deref())
            .with_discoveries(&self.store)
            .with_log(&self.log)
    }

    // --- Tasks ---

    /// Start a new task, creating the workspace on first use.
    pub fn start_task(
        &self,
        ctx: &CancelToken,
        workspace: &str,
        options: StartOptions,
    ) -> Result<TaskReport, ServiceError> {
        ctx.check().map_err(EngineError::from)?;
        let manager = self.manager();
        let ws = match manager.get(workspace) {
            Ok(ws) => ws,
            Err(LifecycleError::WorkspaceNotFound(_)) => {
                manager.create(ctx, workspace, &self.config.branch_for(workspace))?
            }
            Err(err) => return Err(err.into()),
        };
        if ws.status.is_archived() {
            return Err(ServiceError::WorkspaceArchived {
                workspace: ws.name,
                status: ws.status,
            });
        }

        let existing = self.store.list_tasks(workspace)?;
        if let Some(current) = latest_task(&existing).filter(|task| !task.status.is_terminal()) {
            return Err(ServiceError::TaskInProgress {
                workspace: workspace.to_string(),
                task_id: current.id.clone(),
                status: current.status,
            });
        }

        let step_names = if options.steps.is_empty() {
            self.config.tasks.default_steps.clone()
        } else {
            options.steps
        };
        let now = Utc::now();
        let ids = existing.iter().map(|task| task.id.clone()).collect::<Vec<_>>();
        let mut task = Task::new(
            TaskId::generate(now, &ids),
            workspace,
            step_names.into_iter().map(Step::new).collect(),
            now,
        );
        if let Some(pid) = options.agent_pid {
            task = task.with_metadata(meta::AGENT_PID, pid.to_string());
        }
        if let Some(backlog_id) = options.backlog_id {
            task = task.with_metadata(meta::FROM_BACKLOG_ID, backlog_id);
        }
        let outcome = self.engine().start(ctx, &mut task, "task start")?;
        let mut diagnostics = outcome.diagnostics;
        if ws.status == WorkspaceStatus::Paused {
            if let Err(err) = manager.update_status(ctx, workspace, WorkspaceStatus::Active) {
                diagnostics.push(BestEffortFailure::record(
                    BestEffortAction::SyncWorkspaceCache,
                    format!("reactivate workspace '{workspace}': {err}"),
                ));
            }
        }
        diagnostics.extend(self.sync_cache(&task));
        Ok(TaskReport { task, diagnostics })
    }

    pub fn latest_task(&self, workspace: &str) -> Result<Task, ServiceError> {
        self.manager().get(workspace)?;
        let tasks = self.store.list_tasks(workspace)?;
        latest_task(&tasks)
            .cloned()
            .ok_or_else(|| ServiceError::NoTasks {
                workspace: workspace.to_string(),
            })
    }

    /// Record an executor-reported status (validation, push, CI outcomes).
    pub fn set_status(
        &self,
        ctx: &CancelToken,
        workspace: &str,
        to: TaskStatus,
        update: StatusUpdate,
    ) -> Result<TaskReport, ServiceError> {
        let mut task = self.latest_task(workspace)?;
        if !is_reported_transition(task.status, to) {
            return Err(ServiceError::NotReportable {
                task_id: task.id,
                from: task.status,
                to,
            });
        }
        let reason = update
            .reason
            .clone()
            .unwrap_or_else(|| format!("reported {to}"));
        let outcome = self
            .engine()
            .transition_with(ctx, &mut task, to, &reason, |next| {
                if let Some(kind) = update.push_error_type {
                    next.metadata.insert(meta::PUSH_ERROR_TYPE.to_string(), kind);
                }
                if let Some(url) = update.ci_url {
                    next.metadata.insert(meta::CI_URL.to_string(), url);
                }
                if to.is_error() {
                    if let Some(reason) = update.reason {
                        next.metadata.insert(meta::LAST_ERROR.to_string(), reason);
                    }
                }
            })?;
        Ok(self.report(task, outcome))
    }

    pub fn approve(&self, ctx: &CancelToken, workspace: &str) -> Result<TaskReport, ServiceError> {
        let mut task = self.latest_task(workspace)?;
        let outcome = self.engine().approve(ctx, &mut task, "approved")?;
        Ok(self.report(task, outcome))
    }

    pub fn reject(
        &self,
        ctx: &CancelToken,
        workspace: &str,
        mode: RejectMode,
    ) -> Result<TaskReport, ServiceError> {
        let mut task = self.latest_task(workspace)?;
        let engine = self.engine();
        let outcome = match mode {
            RejectMode::Done { feedback } => {
                engine.reject_done(ctx, &mut task, feedback.as_deref())?
            }
            RejectMode::Retry { feedback, step } => {
                engine.reject_retry(ctx, &mut task, &feedback, step)?
            }
        };
        Ok(self.report(task, outcome))
    }

    /// Abandon the latest task and pause its workspace.
    pub fn abandon(
        &self,
        ctx: &CancelToken,
        workspace: &str,
        force: bool,
        reason: Option<&str>,
    ) -> Result<TaskReport, ServiceError> {
        let mut task = self.latest_task(workspace)?;
        let default_reason = if force { "force abandoned" } else { "abandoned" };
        let outcome =
            self.engine()
                .abandon(ctx, &mut task, force, reason.unwrap_or(default_reason))?;
        let mut report = self.report(task, outcome);
        if let Err(err) = self.manager().pause(ctx, workspace) {
            report.diagnostics.push(BestEffortFailure::record(
                BestEffortAction::PauseWorkspace,
                format!("workspace '{workspace}': {err}"),
            ));
        }
        Ok(report)
    }

    /// Apply `action`, or ask `confirmer` to pick one when it is `None`.
    pub fn recover(
        &self,
        ctx: &CancelToken,
        workspace: &str,
        action: Option<RecoveryAction>,
        confirmer: &dyn Confirmer,
    ) -> Result<RecoverReport, ServiceError> {
        let ws = self.manager().get(workspace)?;
        let mut task = self.latest_task(workspace)?;
        let engine = self.engine();
        let orchestrator =
            RecoveryOrchestrator::new(&engine, self.runner.as_deref(), &self.config.git.remote);
        let action = match action {
            Some(action) => action,
            None => orchestrator.choose(&task, confirmer)?,
        };
        let outcome = orchestrator.apply(ctx, &ws, &mut task, action)?;

        let mut diagnostics = Vec::new();
        match &outcome {
            RecoveryOutcome::Resumed { outcome, .. } => {
                diagnostics.extend(outcome.diagnostics.iter().cloned());
                diagnostics.extend(self.sync_cache(&task));
            }
            RecoveryOutcome::Abandoned(outcome) => {
                diagnostics.extend(outcome.diagnostics.iter().cloned());
                diagnostics.extend(self.sync_cache(&task));
                if let Err(err) = self.manager().pause(ctx, workspace) {
                    diagnostics.push(BestEffortFailure::record(
                        BestEffortAction::PauseWorkspace,
                        format!("workspace '{workspace}': {err}"),
                    ));
                }
            }
            RecoveryOutcome::ManualFix { .. } | RecoveryOutcome::CiLogs { .. } => {}
        }
        Ok(RecoverReport {
            task,
            outcome,
            diagnostics,
        })
    }

    /// Put an errored task back to `running` after a manual fix. Any error
    /// state qualifies, whatever its recovery menu offers.
    pub fn resume(&self, ctx: &CancelToken, workspace: &str) -> Result<TaskReport, ServiceError> {
        let mut task = self.latest_task(workspace)?;
        if !task.status.is_error() {
            return Err(ServiceError::NothingToResume {
                task_id: task.id,
                status: task.status,
            });
        }
        let outcome = self
            .engine()
            .transition(ctx, &mut task, TaskStatus::Running, "resume")?;
        let mut report = self.report(task, outcome);
        if let Ok(ws) = self.manager().get(workspace) {
            if ws.status == WorkspaceStatus::Paused {
                if let Err(err) = self
                    .manager()
                    .update_status(ctx, workspace, WorkspaceStatus::Active)
                {
                    report.diagnostics.push(BestEffortFailure::record(
                        BestEffortAction::SyncWorkspaceCache,
                        format!("reactivate workspace '{workspace}': {err}"),
                    ));
                }
            }
        }
        Ok(report)
    }

    // --- Workspaces ---

    pub fn close(&self, ctx: &CancelToken, workspace: &str) -> Result<CloseResult, ServiceError> {
        Ok(self.manager().close(ctx, workspace)?)
    }

    pub fn retire(&self, ctx: &CancelToken, workspace: &str) -> Result<CloseResult, ServiceError> {
        Ok(self.manager().retire(ctx, workspace)?)
    }

    /// Destroy a workspace. Unless `force`, the confirmer must agree first;
    /// `Ok(None)` means the user declined.
    pub fn destroy(
        &self,
        ctx: &CancelToken,
        workspace: &str,
        force: bool,
        confirmer: &dyn Confirmer,
    ) -> Result<Option<DestroyResult>, ServiceError> {
        let manager = self.manager();
        let ws = manager.get(workspace)?;
        if !force {
            if !confirmer.is_interactive() {
                return Err(ServiceError::ConfirmationRequired {
                    action: "destroy",
                    workspace: workspace.to_string(),
                });
            }
            let prompt = format!(
                "Destroy workspace '{}' (branch {}) and all of its tasks?",
                ws.name, ws.branch
            );
            if !confirmer.confirm(&prompt)? {
                tracing::info!(workspace, "destroy declined");
                return Ok(None);
            }
        }
        Ok(Some(manager.destroy(ctx, workspace)?))
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>, ServiceError> {
        Ok(self.manager().list()?)
    }

    /// Every workspace with its latest task as the task store sees it.
    pub fn status(&self) -> Result<Vec<WorkspaceSummary>, ServiceError> {
        self.list_workspaces()?
            .into_iter()
            .map(|workspace| -> Result<WorkspaceSummary, ServiceError> {
                let tasks = self.store.list_tasks(&workspace.name)?;
                Ok(WorkspaceSummary {
                    latest: latest_task(&tasks).cloned(),
                    task_count: tasks.len(),
                    workspace,
                })
            })
            .collect()
    }

    fn report(&self, task: Task, outcome: TransitionOutcome) -> TaskReport {
        let mut diagnostics = outcome.diagnostics;
        diagnostics.extend(self.sync_cache(&task));
        TaskReport { task, diagnostics }
    }

    /// Refresh the workspace's cached entry for `task`.
    fn sync_cache(&self, task: &Task) -> Option<BestEffortFailure> {
        let result = self.store.get_workspace(&task.workspace).and_then(|mut ws| {
            ws.sync_task_ref(task);
            ws.updated_at = Utc::now();
            self.store.update_workspace(&ws)
        });
        result.err().map(|err| {
            BestEffortFailure::record(
                BestEffortAction::SyncWorkspaceCache,
                format!("workspace '{}': {err}", task.workspace),
            )
        })
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
