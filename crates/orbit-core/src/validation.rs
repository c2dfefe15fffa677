//! Validation for configuration and user-supplied names.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::OrbitConfig;

pub const MAX_WORKSPACE_NAME_LEN: usize = 64;

/// Substrings that mark a step as the implementation step a rejected task
/// resumes at.
pub const RESUME_STEP_KEYWORDS: [&str; 4] = ["implement", "implementation", "code", "develop"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

impl ValidationIssue {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Error,
            code,
            message: message.into(),
        }
    }

    fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            level: ValidationLevel::Warning,
            code,
            message: message.into(),
        }
    }
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

impl Validate for OrbitConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.storage.state_path.as_os_str().is_empty() {
            issues.push(ValidationIssue::error(
                "storage.state_path.empty",
                "state_path must not be empty",
            ));
        }

        if self.git.remote.trim().is_empty() {
            issues.push(ValidationIssue::error(
                "git.remote.empty",
                "git remote must not be empty; rebase-and-retry needs it",
            ));
        }

        let prefix = &self.git.branch_prefix;
        if prefix.starts_with('-')
            || prefix.contains("..")
            || prefix.chars().any(|c| c.is_whitespace() || c == '~' || c == '^' || c == ':')
        {
            issues.push(ValidationIssue::error(
                "git.branch_prefix.invalid",
                format!("branch prefix '{prefix}' is not a valid git ref component"),
            ));
        }

        if self.tasks.default_steps.is_empty() {
            issues.push(ValidationIssue::error(
                "tasks.default_steps.empty",
                "default_steps must name at least one step",
            ));
        } else {
            let mut seen = HashSet::new();
            for step in &self.tasks.default_steps {
                if step.trim().is_empty() {
                    issues.push(ValidationIssue::error(
                        "tasks.default_steps.blank",
                        "step names must not be blank",
                    ));
                } else if !seen.insert(step.to_lowercase()) {
                    issues.push(ValidationIssue::warning(
                        "tasks.default_steps.duplicate",
                        format!("step '{step}' is listed more than once"),
                    ));
                }
            }

            let has_resume_step = self.tasks.default_steps.iter().any(|step| {
                let lowered = step.to_lowercase();
                RESUME_STEP_KEYWORDS.iter().any(|kw| lowered.contains(kw))
            });
            if !has_resume_step {
                issues.push(ValidationIssue::warning(
                    "tasks.default_steps.no_resume_step",
                    "no implementation step found; rejected tasks without --step restart at step 1",
                ));
            }
        }

        issues
    }
}

/// A workspace name as typed by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceName<'a>(pub &'a str);

impl Validate for WorkspaceName<'_> {
    fn validate(&self) -> Vec<ValidationIssue> {
        let name = self.0;
        let mut issues = Vec::new();

        if name.is_empty() {
            issues.push(ValidationIssue::error(
                "workspace.name.empty",
                "workspace name must not be empty",
            ));
            return issues;
        }

        if name.len() > MAX_WORKSPACE_NAME_LEN {
            issues.push(ValidationIssue::error(
                "workspace.name.too_long",
                format!("workspace name exceeds {MAX_WORKSPACE_NAME_LEN} characters"),
            ));
        }

        if name.starts_with('.') || name.starts_with('-') {
            issues.push(ValidationIssue::error(
                "workspace.name.leading_char",
                format!("workspace name '{name}' must not start with '.' or '-'"),
            ));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            issues.push(ValidationIssue::error(
                "workspace.name.charset",
                format!("workspace name '{name}' may only contain letters, digits, '.', '-', '_'"),
            ));
        }

        issues
    }
}
