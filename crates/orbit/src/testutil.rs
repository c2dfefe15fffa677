use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use orbit_core::state::TaskStatus;
use orbit_core::types::{Step, Task, TaskId, Workspace};
use orbit_git::{GitError, WorktreeRunner};

use crate::process::{ProcessTerminator, TerminateError};

pub fn mk_task(workspace: &str, id: &str, status: TaskStatus, steps: &[&str]) -> Task {
    let mut task = Task::new(
        TaskId::new(id),
        workspace,
        steps.iter().map(|name| Step::new(*name)).collect(),
        Utc::now() - Duration::minutes(5),
    );
    task.status = status;
    task
}

pub fn mk_workspace(name: &str, worktree_path: Option<PathBuf>) -> Workspace {
    Workspace::new(name, format!("orbit/{name}"), worktree_path, Utc::now())
}

fn command_failed(command: &str) -> GitError {
    GitError::CommandFailed {
        command: command.to_string(),
        status: Some(128),
        stdout: String::new(),
        stderr: "fatal: simulated failure".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebaseBehavior {
    #[default]
    Clean,
    Conflict,
    Fail,
}

/// In-memory `WorktreeRunner` that records every call. `add_worktree` and
/// `remove_worktree` create and delete the directory so on-disk checks see
/// the effect.
#[derive(Debug, Default)]
pub struct FakeRunner {
    pub root: PathBuf,
    pub calls: RefCell<Vec<String>>,
    pub fail_remove: Cell<bool>,
    pub fail_delete_branch: Cell<bool>,
    pub fail_fetch: Cell<bool>,
    pub fail_abort: Cell<bool>,
    pub rebase: Cell<RebaseBehavior>,
}

impl FakeRunner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn log(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }
}

impl WorktreeRunner for FakeRunner {
    fn worktree_path(&self, workspace: &str) -> PathBuf {
        self.root.join(workspace)
    }

    fn add_worktree(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        self.log(format!("add {} {branch}", path.display()));
        std::fs::create_dir_all(path).map_err(|source| GitError::Io {
            command: "mkdir".to_string(),
            source,
        })
    }

    fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError> {
        self.log(format!("remove {} force={force}", path.display()));
        if self.fail_remove.get() {
            return Err(command_failed("git worktree remove"));
        }
        std::fs::remove_dir_all(path).map_err(|source| GitError::Io {
            command: "rm -r".to_string(),
            source,
        })
    }

    fn delete_branch(&self, branch: &str, force: bool) -> Result<(), GitError> {
        self.log(format!("delete-branch {branch} force={force}"));
        if self.fail_delete_branch.get() {
            return Err(command_failed("git branch -D"));
        }
        Ok(())
    }

    fn fetch(&self, dir: &Path, remote: &str) -> Result<(), GitError> {
        self.log(format!("fetch {} {remote}", dir.display()));
        if self.fail_fetch.get() {
            return Err(command_failed("git fetch"));
        }
        Ok(())
    }

    fn rebase(&self, dir: &Path, target: &str) -> Result<(), GitError> {
        self.log(format!("rebase {} {target}", dir.display()));
        match self.rebase.get() {
            RebaseBehavior::Clean => Ok(()),
            RebaseBehavior::Conflict => Err(GitError::RebaseConflict {
                target: target.to_string(),
                dir: dir.to_path_buf(),
            }),
            RebaseBehavior::Fail => Err(command_failed("git rebase")),
        }
    }

    fn rebase_abort(&self, dir: &Path) -> Result<(), GitError> {
        self.log(format!("rebase-abort {}", dir.display()));
        if self.fail_abort.get() {
            return Err(command_failed("git rebase --abort"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingTerminator {
    pub pids: RefCell<Vec<u32>>,
    pub fail: bool,
}

impl RecordingTerminator {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl ProcessTerminator for RecordingTerminator {
    fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
        self.pids.borrow_mut().push(pid);
        if self.fail {
            return Err(TerminateError::Signal {
                pid,
                message: "Operation not permitted".to_string(),
            });
        }
        Ok(())
    }
}
