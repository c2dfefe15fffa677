use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::GitError;

/// Captured output of a successful git invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Stdout with surrounding whitespace removed, for single-value queries
    /// like `rev-parse`.
    pub fn line(&self) -> &str {
        self.stdout.trim()
    }
}

/// Synchronous handle on the `git` executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCli {
    pub binary: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn prepare<I, S>(&self, cwd: &Path, args: I) -> (Command, String)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        let mut rendered = self.binary.to_string_lossy().into_owned();
        for arg in args {
            rendered.push(' ');
            rendered.push_str(&arg.as_ref().to_string_lossy());
            command.arg(arg.as_ref());
        }
        // No editor or credential prompt may block a run.
        command
            .current_dir(cwd)
            .env("GIT_EDITOR", "true")
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null());
        tracing::debug!(command = %rendered, cwd = %cwd.display(), "running git");
        (command, rendered)
    }

    pub fn run<I, S>(&self, cwd: &Path, args: I) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (mut command, rendered) = self.prepare(cwd, args);
        let output = command.output().map_err(|source| GitError::Io {
            command: rendered.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(GitOutput { stdout, stderr })
        } else {
            Err(GitError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stdout,
                stderr,
            })
        }
    }

    /// Exit status as a boolean. Only a failure to spawn git is an error.
    pub fn probe<I, S>(&self, cwd: &Path, args: I) -> Result<bool, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (mut command, rendered) = self.prepare(cwd, args);
        command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .map_err(|source| GitError::Io {
                command: rendered,
                source,
            })
    }
}
