//! Configuration loaded from `.orbit/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = ".orbit/config.toml";
pub const DEFAULT_STATE_PATH: &str = ".orbit/state.sqlite";
pub const DEFAULT_TRANSITION_LOG_ROOT: &str = ".orbit/transitions";
pub const DEFAULT_WORKTREE_ROOT: &str = ".orbit/wt";
pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_BRANCH_PREFIX: &str = "orbit/";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrbitConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding workspaces, tasks and artifacts.
    pub state_path: PathBuf,
    /// Root of the per-task JSONL transition mirror.
    pub transition_log_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            transition_log_root: PathBuf::from(DEFAULT_TRANSITION_LOG_ROOT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub binary: PathBuf,
    /// Remote fetched and rebased onto by rebase-and-retry.
    pub remote: String,
    pub branch_prefix: String,
    /// Worktree directory root, relative to the repository root.
    pub worktree_root: PathBuf,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            remote: DEFAULT_REMOTE.to_string(),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            worktree_root: PathBuf::from(DEFAULT_WORKTREE_ROOT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Pipeline steps given to a task when `start` names none.
    pub default_steps: Vec<String>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            default_steps: [
                "analyze",
                "implement",
                "validate",
                "git_commit",
                "git_push",
                "git_pr",
                "ci_wait",
                "review",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl OrbitConfig {
    pub fn branch_for(&self, workspace: &str) -> String {
        format!("{}{workspace}", self.git.branch_prefix)
    }
}

pub fn parse_config(contents: &str) -> Result<OrbitConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<OrbitConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// Like `load_config`, but a missing file yields the defaults.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<OrbitConfig, ConfigError> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        return Ok(OrbitConfig::default());
    }
    load_config(path_ref)
}
