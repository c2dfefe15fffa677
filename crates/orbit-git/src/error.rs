use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("could not run `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed ({}): {}", exit_label(.status), .stderr.trim())]
    CommandFailed {
        command: String,
        /// `None` when git was killed by a signal.
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("{} is not inside a git repository", .path.display())]
    NotARepository { path: PathBuf },
    #[error("rebase onto {target} stopped on conflicts in {}", .dir.display())]
    RebaseConflict { target: String, dir: PathBuf },
}

impl GitError {
    pub fn is_rebase_conflict(&self) -> bool {
        matches!(self, GitError::RebaseConflict { .. })
    }
}

fn exit_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit {code}"),
        None => "killed by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::GitError;
    use std::error::Error;
    use std::path::PathBuf;

    #[test]
    fn command_failed_renders_exit_and_trimmed_stderr() {
        let err = GitError::CommandFailed {
            command: "git worktree remove /tmp/wt".to_string(),
            status: Some(128),
            stdout: String::new(),
            stderr: "fatal: '/tmp/wt' is not a working tree\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "`git worktree remove /tmp/wt` failed (exit 128): fatal: '/tmp/wt' is not a working tree"
        );

        let killed = GitError::CommandFailed {
            command: "git fetch origin".to_string(),
            status: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("killed by signal"));
    }

    #[test]
    fn io_keeps_its_source() {
        let err = GitError::Io {
            command: "git status".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing binary"),
        };
        assert_eq!(err.to_string(), "could not run `git status`: missing binary");
        assert!(err.source().is_some());
    }

    #[test]
    fn only_rebase_conflicts_are_flagged() {
        let err = GitError::RebaseConflict {
            target: "origin/orbit/auth".to_string(),
            dir: PathBuf::from("/repo/.orbit/wt/auth"),
        };
        assert!(err.is_rebase_conflict());
        assert_eq!(
            err.to_string(),
            "rebase onto origin/orbit/auth stopped on conflicts in /repo/.orbit/wt/auth"
        );

        let err = GitError::NotARepository {
            path: PathBuf::from("/tmp/example"),
        };
        assert!(!err.is_rebase_conflict());
        assert_eq!(err.to_string(), "/tmp/example is not inside a git repository");
    }
}
