use chrono::{DateTime, Utc};
use orbit_core::state::TaskStatus;
use orbit_core::types::{TaskId, TransitionRecord};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TransitionLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize transition: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read log file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed entry in {path} line {line}: {source}")]
    Decode {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One line of a task's transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub workspace: String,
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl TransitionLogEntry {
    pub fn new(workspace: &str, task_id: &TaskId, record: &TransitionRecord) -> Self {
        Self {
            workspace: workspace.to_string(),
            task_id: task_id.clone(),
            from: record.from,
            to: record.to,
            reason: record.reason.clone(),
            at: record.at,
        }
    }
}

/// Append-only mirror of task transitions, one file per task under
/// `<root>/<workspace>/<task_id>.jsonl`. The task store stays authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlTransitionLog {
    pub root: PathBuf,
}

impl JsonlTransitionLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.root.join(workspace)
    }

    pub fn task_log_path(&self, workspace: &str, task_id: &TaskId) -> PathBuf {
        self.workspace_dir(workspace)
            .join(format!("{}.jsonl", task_id.0))
    }

    pub fn append(&self, entry: &TransitionLogEntry) -> Result<(), TransitionLogError> {
        let dir = self.workspace_dir(&entry.workspace);
        fs::create_dir_all(&dir).map_err(|source| TransitionLogError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        append_json_line(&self.task_log_path(&entry.workspace, &entry.task_id), entry)
    }

    /// Entries for one task in append order. A task that never logged
    /// anything has an empty history.
    pub fn read(
        &self,
        workspace: &str,
        task_id: &TaskId,
    ) -> Result<Vec<TransitionLogEntry>, TransitionLogError> {
        let path = self.task_log_path(workspace, task_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(TransitionLogError::Read { path, source }),
        };
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|source| TransitionLogError::Decode {
                    path: path.clone(),
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }

    /// Drop every log under a workspace. Missing directories are fine.
    pub fn remove_workspace(&self, workspace: &str) -> std::io::Result<()> {
        match fs::remove_dir_all(self.workspace_dir(workspace)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

fn append_json_line(path: &Path, entry: &TransitionLogEntry) -> Result<(), TransitionLogError> {
    let mut line =
        serde_json::to_string(entry).map_err(|source| TransitionLogError::Serialize { source })?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TransitionLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(line.as_bytes())
        .map_err(|source| TransitionLogError::Append {
            path: path.to_path_buf(),
            source,
        })
}
