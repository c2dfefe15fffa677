//! Recovery from task error states.

use orbit_core::state::TaskStatus;
use orbit_core::types::{meta, PushErrorType, Task, TaskId, Workspace};
use orbit_git::{GitError, WorktreeRunner};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cancel::{CancelToken, Cancelled};
use crate::confirm::{ConfirmError, Confirmer};
use crate::engine::{EngineError, TaskEngine, TransitionOutcome};
use crate::types::{BestEffortAction, BestEffortFailure, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    Retry,
    RebaseAndRetry,
    FixManually,
    ContinueWaiting,
    ViewCiLogs,
    Abandon,
}

impl RecoveryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::RebaseAndRetry => "rebase-and-retry",
            RecoveryAction::FixManually => "fix-manually",
            RecoveryAction::ContinueWaiting => "continue-waiting",
            RecoveryAction::ViewCiLogs => "view-ci-logs",
            RecoveryAction::Abandon => "abandon",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry the task from where it stopped",
            RecoveryAction::RebaseAndRetry => "fetch, rebase onto the remote branch, then retry",
            RecoveryAction::FixManually => "fix it by hand in the worktree, then resume",
            RecoveryAction::ContinueWaiting => "keep waiting for CI",
            RecoveryAction::ViewCiLogs => "show the CI run URL",
            RecoveryAction::Abandon => "abandon the task",
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("task {task_id} status {status} is not recoverable")]
    NotRecoverable { task_id: TaskId, status: TaskStatus },
    #[error("invalid transition: {action} is not available for task {task_id} in status {status}")]
    ActionNotAllowed {
        task_id: TaskId,
        status: TaskStatus,
        action: RecoveryAction,
    },
    #[error("task {task_id}: choose a recovery action ({options}); no terminal to ask")]
    ConfirmationRequired { task_id: TaskId, options: String },
    #[error("workspace '{workspace}': git is unavailable, cannot {action}")]
    GitUnavailable {
        workspace: String,
        action: RecoveryAction,
    },
    #[error("workspace '{workspace}' has no worktree on disk")]
    NoWorktree { workspace: String },
    #[error(
        "rebase onto {target} hit conflicts and was aborted. Resolve by hand:\n  cd {}\n  git rebase {target}\n  # fix conflicts, then: git add <files> && git rebase --continue\n  orbit resume {workspace}",
        .dir.display()
    )]
    RebaseConflict {
        workspace: String,
        target: String,
        dir: PathBuf,
        diagnostics: Vec<BestEffortFailure>,
    },
    #[error("workspace '{workspace}': {source}")]
    Git {
        workspace: String,
        #[source]
        source: GitError,
    },
    #[error("failed to read recovery choice: {0}")]
    Prompt(#[from] ConfirmError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl RecoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecoveryError::NotRecoverable { .. } | RecoveryError::NoWorktree { .. } => {
                ErrorKind::Precondition
            }
            RecoveryError::ActionNotAllowed { .. } => ErrorKind::InvalidTransition,
            RecoveryError::ConfirmationRequired { .. } => ErrorKind::ConfirmationRequired,
            RecoveryError::GitUnavailable { .. }
            | RecoveryError::RebaseConflict { .. }
            | RecoveryError::Git { .. } => ErrorKind::External,
            RecoveryError::Prompt(_) => ErrorKind::Internal,
            RecoveryError::Engine(err) => err.kind(),
            RecoveryError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The task is running again (retry, rebase-and-retry, continue-waiting).
    Resumed {
        action: RecoveryAction,
        outcome: TransitionOutcome,
    },
    Abandoned(TransitionOutcome),
    ManualFix {
        worktree_path: Option<PathBuf>,
        hint: String,
    },
    CiLogs { url: Option<String> },
}

/// Legal recovery actions for `task`, in menu order.
pub fn actions_for(task: &Task) -> Result<Vec<RecoveryAction>, RecoveryError> {
    use RecoveryAction::*;

    let actions = match task.status {
        TaskStatus::ValidationFailed => vec![Retry, FixManually, Abandon],
        TaskStatus::GhFailed => match task.push_error_type() {
            Some(PushErrorType::NonFastForward) => vec![RebaseAndRetry, FixManually, Abandon],
            Some(PushErrorType::Network) => vec![Retry, Abandon],
            Some(PushErrorType::AuthFailed) | None => vec![Retry, FixManually, Abandon],
        },
        TaskStatus::CiFailed => vec![Retry, ViewCiLogs, FixManually, Abandon],
        TaskStatus::CiTimeout => vec![ContinueWaiting, Retry, ViewCiLogs, FixManually, Abandon],
        status => {
            return Err(RecoveryError::NotRecoverable {
                task_id: task.id.clone(),
                status,
            })
        }
    };
    Ok(actions)
}

pub fn resume_hint(workspace: &str) -> String {
    format!("orbit resume {workspace}")
}

pub struct RecoveryOrchestrator<'a> {
    engine: &'a TaskEngine<'a>,
    runner: Option<&'a dyn WorktreeRunner>,
    remote: &'a str,
}

impl<'a> RecoveryOrchestrator<'a> {
    pub fn new(
        engine: &'a TaskEngine<'a>,
        runner: Option<&'a dyn WorktreeRunner>,
        remote: &'a str,
    ) -> Self {
        Self {
            engine,
            runner,
            remote,
        }
    }

    /// Ask `confirmer` to pick one of the task's actions.
    pub fn choose(
        &self,
        task: &Task,
        confirmer: &dyn Confirmer,
    ) -> Result<RecoveryAction, RecoveryError> {
        let actions = actions_for(task)?;
        if !confirmer.is_interactive() {
            return Err(RecoveryError::ConfirmationRequired {
                task_id: task.id.clone(),
                options: actions
                    .iter()
                    .map(|action| action.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        let labels = actions
            .iter()
            .map(|action| format!("{}: {}", action, action.description()))
            .collect::<Vec<_>>();
        let prompt = format!("task {} is {}. How do you want to recover?", task.id, task.status);
        let idx = confirmer.select(&prompt, &labels)?;
        actions
            .get(idx)
            .copied()
            .ok_or(RecoveryError::Prompt(ConfirmError::NoOptions))
    }

    pub fn apply(
        &self,
        ctx: &CancelToken,
        workspace: &Workspace,
        task: &mut Task,
        action: RecoveryAction,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        ctx.check()?;
        if !actions_for(task)?.contains(&action) {
            return Err(RecoveryError::ActionNotAllowed {
                task_id: task.id.clone(),
                status: task.status,
                action,
            });
        }

        let outcome = match action {
            RecoveryAction::Retry => RecoveryOutcome::Resumed {
                action,
                outcome: self
                    .engine
                    .transition(ctx, task, TaskStatus::Running, "recover: retry")?,
            },
            RecoveryAction::ContinueWaiting => RecoveryOutcome::Resumed {
                action,
                outcome: self.engine.transition(
                    ctx,
                    task,
                    TaskStatus::Running,
                    "recover: continue waiting for CI",
                )?,
            },
            RecoveryAction::RebaseAndRetry => RecoveryOutcome::Resumed {
                action,
                outcome: self.rebase_and_retry(ctx, workspace, task)?,
            },
            RecoveryAction::FixManually => RecoveryOutcome::ManualFix {
                worktree_path: workspace.worktree_path.clone(),
                hint: resume_hint(&workspace.name),
            },
            RecoveryAction::ViewCiLogs => RecoveryOutcome::CiLogs {
                url: task.meta(meta::CI_URL).map(str::to_string),
            },
            RecoveryAction::Abandon => RecoveryOutcome::Abandoned(self.engine.abandon(
                ctx,
                task,
                false,
                "recover: abandon",
            )?),
        };
        Ok(outcome)
    }

    fn rebase_and_retry(
        &self,
        ctx: &CancelToken,
        workspace: &Workspace,
        task: &mut Task,
    ) -> Result<TransitionOutcome, RecoveryError> {
        let runner = self.runner.ok_or_else(|| RecoveryError::GitUnavailable {
            workspace: workspace.name.clone(),
            action: RecoveryAction::RebaseAndRetry,
        })?;
        let dir = workspace
            .worktree_path
            .clone()
            .filter(|path| path.exists())
            .ok_or_else(|| RecoveryError::NoWorktree {
                workspace: workspace.name.clone(),
            })?;
        let git_error = |source| RecoveryError::Git {
            workspace: workspace.name.clone(),
            source,
        };

        ctx.check()?;
        runner.fetch(&dir, self.remote).map_err(git_error)?;

        let target = format!("{}/{}", self.remote, workspace.branch);
        ctx.check()?;
        match runner.rebase(&dir, &target) {
            Ok(()) => {}
            Err(err) if err.is_rebase_conflict() => {
                let mut diagnostics = Vec::new();
                if let Err(abort) = runner.rebase_abort(&dir) {
                    diagnostics.push(BestEffortFailure::record(
                        BestEffortAction::AbortRebase,
                        format!("{}: {abort}", dir.display()),
                    ));
                }
                return Err(RecoveryError::RebaseConflict {
                    workspace: workspace.name.clone(),
                    target,
                    dir,
                    diagnostics,
                });
            }
            Err(err) => return Err(git_error(err)),
        }

        let reason = format!("recover: rebased onto {target}");
        Ok(self
            .engine
            .transition_with(ctx, task, TaskStatus::Running, &reason, |next| {
                next.metadata.remove(meta::PUSH_ERROR_TYPE);
            })?)
    }
}
