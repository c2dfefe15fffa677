use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::command::{GitCli, GitOutput};
use crate::error::GitError;
use crate::repo::{branch_exists, discover_repo, RepoHandle};

pub const DEFAULT_WORKTREE_ROOT: &str = ".orbit/wt";

/// Git operations the workspace lifecycle and recovery paths depend on.
///
/// Callers hold this as an `Option`: outside a repository there is no runner
/// and every call site must degrade accordingly.
pub trait WorktreeRunner {
    /// Where the worktree for `workspace` lives (whether or not it exists).
    fn worktree_path(&self, workspace: &str) -> PathBuf;
    /// Check out `branch` into `path`, creating the branch from HEAD if needed.
    fn add_worktree(&self, path: &Path, branch: &str) -> Result<(), GitError>;
    fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError>;
    fn delete_branch(&self, branch: &str, force: bool) -> Result<(), GitError>;
    fn fetch(&self, dir: &Path, remote: &str) -> Result<(), GitError>;
    /// Rebase the checkout in `dir` onto `target`. Conflicts surface as
    /// `GitError::RebaseConflict` with the rebase left in progress.
    fn rebase(&self, dir: &Path, target: &str) -> Result<(), GitError>;
    fn rebase_abort(&self, dir: &Path) -> Result<(), GitError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitWorktreeRunner {
    git: GitCli,
    repo: RepoHandle,
    relative_root: PathBuf,
}

impl GitWorktreeRunner {
    pub fn new(git: GitCli, repo: RepoHandle, relative_root: impl Into<PathBuf>) -> Self {
        Self {
            git,
            repo,
            relative_root: relative_root.into(),
        }
    }

    /// Returns `Ok(None)` when `start_path` is not inside a repository.
    pub fn discover(
        start_path: &Path,
        git: GitCli,
        relative_root: impl Into<PathBuf>,
    ) -> Result<Option<Self>, GitError> {
        match discover_repo(start_path, &git) {
            Ok(repo) => Ok(Some(Self::new(git, repo, relative_root))),
            Err(GitError::NotARepository { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn repo(&self) -> &RepoHandle {
        &self.repo
    }

    fn run_in<I>(&self, dir: &Path, args: I) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = OsString>,
    {
        self.git.run(dir, args)
    }

    fn rebase_in_progress(&self, dir: &Path) -> bool {
        ["rebase-merge", "rebase-apply"].iter().any(|name| {
            self.git
                .run(dir, ["rev-parse", "--git-path", name])
                .map(|out| {
                    let path = PathBuf::from(out.line());
                    if path.is_absolute() {
                        path.exists()
                    } else {
                        dir.join(path).exists()
                    }
                })
                .unwrap_or(false)
        })
    }
}

impl WorktreeRunner for GitWorktreeRunner {
    fn worktree_path(&self, workspace: &str) -> PathBuf {
        self.repo.root.join(&self.relative_root).join(workspace)
    }

    fn add_worktree(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| GitError::Io {
                command: format!("create_dir_all {}", parent.display()),
                source,
            })?;
        }

        let mut args = vec![OsString::from("worktree"), OsString::from("add")];
        if branch_exists(&self.repo, &self.git, branch)? {
            args.push(path.as_os_str().to_os_string());
            args.push(OsString::from(branch));
        } else {
            args.push(OsString::from("-b"));
            args.push(OsString::from(branch));
            args.push(path.as_os_str().to_os_string());
        }
        self.run_in(&self.repo.root, args)?;
        Ok(())
    }

    fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let mut args = vec![OsString::from("worktree"), OsString::from("remove")];
        if force {
            args.push(OsString::from("--force"));
        }
        args.push(path.as_os_str().to_os_string());
        self.run_in(&self.repo.root, args)?;
        Ok(())
    }

    fn delete_branch(&self, branch: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.git.run(&self.repo.root, ["branch", flag, branch])?;
        Ok(())
    }

    fn fetch(&self, dir: &Path, remote: &str) -> Result<(), GitError> {
        self.git.run(dir, ["fetch", remote])?;
        Ok(())
    }

    fn rebase(&self, dir: &Path, target: &str) -> Result<(), GitError> {
        match self.git.run(dir, ["rebase", target]) {
            Ok(_) => Ok(()),
            Err(GitError::CommandFailed {
                command,
                status,
                stdout,
                stderr,
            }) => {
                if looks_like_conflict(&stdout, &stderr) || self.rebase_in_progress(dir) {
                    Err(GitError::RebaseConflict {
                        target: target.to_string(),
                        dir: dir.to_path_buf(),
                    })
                } else {
                    Err(GitError::CommandFailed {
                        command,
                        status,
                        stdout,
                        stderr,
                    })
                }
            }
            Err(err) => Err(err),
        }
    }

    fn rebase_abort(&self, dir: &Path) -> Result<(), GitError> {
        self.git.run(dir, ["rebase", "--abort"])?;
        Ok(())
    }
}

fn looks_like_conflict(stdout: &str, stderr: &str) -> bool {
    [stdout, stderr].iter().any(|stream| {
        stream.contains("CONFLICT")
            || stream.contains("could not apply")
            || stream.contains("Resolve all conflicts")
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{looks_like_conflict, GitWorktreeRunner, WorktreeRunner, DEFAULT_WORKTREE_ROOT};
    use crate::command::GitCli;
    use crate::error::GitError;
    use crate::repo::branch_exists;
    use crate::testutil::{commit_file, init_repo, run_git};

    fn runner_for(root: &std::path::Path) -> GitWorktreeRunner {
        GitWorktreeRunner::discover(root, GitCli::default(), DEFAULT_WORKTREE_ROOT)
            .expect("discover")
            .expect("inside repository")
    }

    #[test]
    fn discover_returns_none_outside_repository() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = GitWorktreeRunner::discover(dir.path(), GitCli::default(), DEFAULT_WORKTREE_ROOT)
            .expect("discover should not error");
        assert!(runner.is_none());
    }

    #[test]
    fn worktree_path_is_rooted_under_relative_root() {
        let (_dir, root) = init_repo();
        let runner = runner_for(&root);
        assert_eq!(
            runner.worktree_path("auth"),
            root.join(".orbit").join("wt").join("auth")
        );
    }

    #[test]
    fn add_creates_branch_and_remove_keeps_it() {
        let (_dir, root) = init_repo();
        let runner = runner_for(&root);
        let path = runner.worktree_path("auth");

        runner.add_worktree(&path, "orbit/auth").expect("add worktree");
        assert!(path.join("README.md").exists());
        assert!(branch_exists(runner.repo(), &GitCli::default(), "orbit/auth").unwrap());

        runner.remove_worktree(&path, false).expect("remove worktree");
        assert!(!path.exists());
        assert!(branch_exists(runner.repo(), &GitCli::default(), "orbit/auth").unwrap());

        runner.add_worktree(&path, "orbit/auth").expect("re-add on existing branch");
        assert!(path.exists());
    }

    #[test]
    fn delete_branch_after_forced_worktree_removal() {
        let (_dir, root) = init_repo();
        let runner = runner_for(&root);
        let path = runner.worktree_path("scratch");
        runner.add_worktree(&path, "orbit/scratch").expect("add worktree");
        fs::write(path.join("dirty.txt"), "uncommitted").expect("dirty file");

        let err = runner
            .remove_worktree(&path, false)
            .expect_err("dirty worktree needs force");
        assert!(matches!(err, GitError::CommandFailed { .. }));

        runner.remove_worktree(&path, true).expect("forced removal");
        runner.delete_branch("orbit/scratch", true).expect("delete branch");
        assert!(!branch_exists(runner.repo(), &GitCli::default(), "orbit/scratch").unwrap());
    }

    #[test]
    fn removing_unknown_worktree_fails() {
        let (_dir, root) = init_repo();
        let runner = runner_for(&root);
        let err = runner
            .remove_worktree(&runner.worktree_path("ghost"), true)
            .expect_err("no such worktree");
        assert!(matches!(err, GitError::CommandFailed { .. }));
    }

    #[test]
    fn rebase_onto_updated_base_succeeds() {
        let (_dir, root) = init_repo();
        let runner = runner_for(&root);
        let path = runner.worktree_path("feat");
        runner.add_worktree(&path, "orbit/feat").expect("add worktree");

        commit_file(&path, "feature.txt", "feature\n", "feature work");
        commit_file(&root, "main.txt", "main\n", "main work");

        runner.rebase(&path, "main").expect("clean rebase");
        assert!(path.join("main.txt").exists());
        assert!(path.join("feature.txt").exists());
    }

    #[test]
    fn rebase_conflict_is_classified_and_abortable() {
        let (_dir, root) = init_repo();
        let runner = runner_for(&root);
        let path = runner.worktree_path("clash");
        runner.add_worktree(&path, "orbit/clash").expect("add worktree");

        commit_file(&path, "README.md", "feature side\n", "feature edit");
        commit_file(&root, "README.md", "main side\n", "main edit");

        let err = runner.rebase(&path, "main").expect_err("conflicting rebase");
        assert!(err.is_rebase_conflict(), "{err:?}");

        runner.rebase_abort(&path).expect("abort rebase");
        let contents = fs::read_to_string(path.join("README.md")).expect("read file");
        assert_eq!(contents, "feature side\n");
        let status = run_git(&path, &["status", "--porcelain"]);
        assert!(status.trim().is_empty());
    }

    #[test]
    fn fetch_from_unknown_remote_fails() {
        let (_dir, root) = init_repo();
        let runner = runner_for(&root);
        let err = runner
            .fetch(&root, "nowhere")
            .expect_err("unknown remote");
        assert!(matches!(err, GitError::CommandFailed { .. }));
    }

    #[test]
    fn conflict_markers_are_detected_in_either_stream() {
        assert!(looks_like_conflict("CONFLICT (content): Merge conflict in a", ""));
        assert!(looks_like_conflict("", "error: could not apply 1234abc... edit"));
        assert!(!looks_like_conflict("", "fatal: invalid upstream 'origin/x'"));
    }
}
