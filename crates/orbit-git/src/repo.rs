use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::command::GitCli;
use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoHandle {
    pub root: PathBuf,
    pub git_dir: PathBuf,
}

/// Locate the main repository from any path inside it, including a linked
/// worktree, so worktree paths are always computed from the same root.
pub fn discover_repo(start_path: &Path, git: &GitCli) -> Result<RepoHandle, GitError> {
    let inside = match git.run(start_path, ["rev-parse", "--is-inside-work-tree"]) {
        Ok(output) => output.line() == "true",
        Err(GitError::CommandFailed { .. }) => false,
        Err(err) => return Err(err),
    };
    if !inside {
        return Err(GitError::NotARepository {
            path: start_path.to_path_buf(),
        });
    }

    let common = git.run(start_path, ["rev-parse", "--git-common-dir"])?;
    let git_dir = absolute_from(start_path, common.line());
    let root = if git_dir.file_name() == Some(OsStr::new(".git")) {
        git_dir.parent().map(Path::to_path_buf)
    } else {
        None
    };
    let root = match root {
        Some(root) => root,
        None => {
            let top = git.run(start_path, ["rev-parse", "--show-toplevel"])?;
            PathBuf::from(top.line())
        }
    };

    Ok(RepoHandle { root, git_dir })
}

fn absolute_from(base: &Path, reported: &str) -> PathBuf {
    let path = base.join(reported);
    std::fs::canonicalize(&path).unwrap_or(path)
}

pub fn branch_exists(repo: &RepoHandle, git: &GitCli, branch: &str) -> Result<bool, GitError> {
    let reference = format!("refs/heads/{branch}");
    git.probe(&repo.root, ["rev-parse", "--verify", "--quiet", reference.as_str()])
}
