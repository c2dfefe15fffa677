//! Legal task status transitions.

use chrono::{DateTime, Utc};
use orbit_core::state::TaskStatus;
use orbit_core::types::{Task, TaskId, TransitionRecord};

use crate::cancel::{CancelToken, Cancelled};
use crate::types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("task {task_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl StateMachineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateMachineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            StateMachineError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

/// Check if a status transition is an edge of the task graph.
///
/// ```text
/// pending -> running -> validating -> awaiting_approval -> completed | rejected
///               |            \-> validation_failed           |
///               |-> gh_failed | ci_failed | ci_timeout       \-> running (reject --retry)
///               \-> abandoned (force only)
/// error states -> running (retry) | abandoned
/// ```
pub fn is_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    match (from, to) {
        (Pending, Running) => true,
        (Running, Validating) => true,
        // Push and CI polling run while the task is running.
        (Running, GhFailed | CiFailed | CiTimeout) => true,
        // Engine only takes this edge for a forced abandon.
        (Running, Abandoned) => true,
        (Validating, AwaitingApproval | ValidationFailed) => true,
        (AwaitingApproval, Completed | Rejected | Running) => true,
        (ValidationFailed | GhFailed | CiFailed | CiTimeout, Running | Abandoned) => true,
        _ => false,
    }
}

/// Edges an executor reports directly: validation, push and CI outcomes.
/// Abandon, approval, rejection and recovery have their own operations.
pub fn is_reported_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    matches!(
        (from, to),
        (Running, Validating | GhFailed | CiFailed | CiTimeout)
            | (Validating, AwaitingApproval | ValidationFailed)
    )
}

/// Validate and apply a transition, stamping it with the current time.
pub fn transition(
    ctx: &CancelToken,
    task: &mut Task,
    to: TaskStatus,
    reason: &str,
) -> Result<TransitionRecord, StateMachineError> {
    ctx.check()?;
    transition_at(task, to, reason, Utc::now())
}

/// Validate and apply a transition. On error `task` is untouched.
pub fn transition_at(
    task: &mut Task,
    to: TaskStatus,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<TransitionRecord, StateMachineError> {
    let from = task.status;
    if !is_transition_allowed(from, to) {
        return Err(StateMachineError::InvalidTransition {
            task_id: task.id.clone(),
            from,
            to,
        });
    }

    let record = TransitionRecord {
        from,
        to,
        reason: reason.to_string(),
        at,
    };
    task.transitions.push(record.clone());
    task.status = to;
    task.updated_at = at;
    Ok(record)
}

/// True when the transition log chains from `pending` to the current status.
pub fn history_is_consistent(task: &Task) -> bool {
    let mut expected_from = TaskStatus::Pending;
    for record in &task.transitions {
        if record.from != expected_from || !is_transition_allowed(record.from, record.to) {
            return false;
        }
        expected_from = record.to;
    }
    expected_from == task.status
}
