//! Error classification and best-effort diagnostics shared across orbit.

use serde::{Deserialize, Serialize};

/// Coarse classification every orbit error maps onto, so callers can render
/// or pick an exit code without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    /// The request is well-formed but the current state forbids it.
    Precondition,
    /// A confirmation was needed and no terminal is attached.
    ConfirmationRequired,
    /// Malformed input (empty feedback, step out of range).
    Validation,
    /// git or another external system failed.
    External,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::NotFound => 3,
            ErrorKind::InvalidTransition | ErrorKind::Validation => 4,
            ErrorKind::Precondition | ErrorKind::ConfirmationRequired => 5,
            ErrorKind::External => 6,
            ErrorKind::Cancelled => 130,
            ErrorKind::Internal => 1,
        }
    }
}

/// Side effects that are attempted but never allowed to fail the primary
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BestEffortAction {
    TerminateProcess,
    PauseWorkspace,
    SyncWorkspaceCache,
    MirrorTransitionLog,
    DeleteDiscovery,
    RemoveTransitionLog,
    AbortRebase,
}

impl BestEffortAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BestEffortAction::TerminateProcess => "terminate_process",
            BestEffortAction::PauseWorkspace => "pause_workspace",
            BestEffortAction::SyncWorkspaceCache => "sync_workspace_cache",
            BestEffortAction::MirrorTransitionLog => "mirror_transition_log",
            BestEffortAction::DeleteDiscovery => "delete_discovery",
            BestEffortAction::RemoveTransitionLog => "remove_transition_log",
            BestEffortAction::AbortRebase => "abort_rebase",
        }
    }
}

impl std::fmt::Display for BestEffortAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic for a best-effort side effect that failed. Logged at `warn`
/// and returned next to a successful primary result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestEffortFailure {
    pub action: BestEffortAction,
    pub message: String,
}

impl BestEffortFailure {
    pub fn record(action: BestEffortAction, message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::warn!(action = %action, "{message}");
        Self { action, message }
    }
}

impl std::fmt::Display for BestEffortFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.action, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::{BestEffortAction, BestEffortFailure, ErrorKind};

    #[test]
    fn exit_codes_distinguish_error_families() {
        assert_eq!(ErrorKind::NotFound.exit_code(), 3);
        assert_eq!(ErrorKind::InvalidTransition.exit_code(), 4);
        assert_eq!(ErrorKind::Validation.exit_code(), 4);
        assert_eq!(ErrorKind::ConfirmationRequired.exit_code(), 5);
        assert_eq!(ErrorKind::External.exit_code(), 6);
        assert_eq!(ErrorKind::Cancelled.exit_code(), 130);
    }

    #[test]
    fn best_effort_failure_renders_action_and_message() {
        let failure =
            BestEffortFailure::record(BestEffortAction::PauseWorkspace, "store is read-only");
        assert_eq!(failure.to_string(), "pause_workspace: store is read-only");
    }
}
