//! Persisted task transitions: abandonment, approval and rejection.
//!
//! Every mutation is applied to a clone, written to the task store, and only
//! then committed back to the caller's `Task`. A failed validation or store
//! write leaves the caller's copy untouched.

use chrono::Utc;
use orbit_core::state::TaskStatus;
use orbit_core::types::{artifact, meta, Step, Task, TaskId, TransitionRecord};
use orbit_core::validation::RESUME_STEP_KEYWORDS;

use crate::cancel::{CancelToken, Cancelled};
use crate::persistence::PersistenceError;
use crate::process::ProcessTerminator;
use crate::state_machine::{transition_at, StateMachineError};
use crate::store::TaskStore;
use crate::transition_log::{JsonlTransitionLog, TransitionLogEntry};
use crate::types::{BestEffortAction, BestEffortFailure, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transition(#[from] StateMachineError),
    #[error(
        "invalid transition: task {task_id} status {status} cannot be abandoned without --force"
    )]
    ForceRequired { task_id: TaskId, status: TaskStatus },
    #[error("task {task_id}: rejection feedback is required to retry")]
    EmptyFeedback { task_id: TaskId },
    #[error("task {task_id}: step {step} is out of range (expected 1..={len})")]
    StepOutOfRange {
        task_id: TaskId,
        step: i64,
        len: usize,
    },
    #[error(transparent)]
    Store(#[from] PersistenceError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transition(err) => err.kind(),
            EngineError::ForceRequired { .. } => ErrorKind::InvalidTransition,
            EngineError::EmptyFeedback { .. } | EngineError::StepOutOfRange { .. } => {
                ErrorKind::Validation
            }
            EngineError::Store(err) => err.kind(),
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

/// A committed transition plus any best-effort side effects that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub record: TransitionRecord,
    pub diagnostics: Vec<BestEffortFailure>,
}

pub struct TaskEngine<'a> {
    store: &'a dyn TaskStore,
    log: Option<&'a JsonlTransitionLog>,
    terminator: &'a dyn ProcessTerminator,
}

impl<'a> TaskEngine<'a> {
    pub fn new(store: &'a dyn TaskStore, terminator: &'a dyn ProcessTerminator) -> Self {
        Self {
            store,
            log: None,
            terminator,
        }
    }

    /// Mirror committed transitions to `log`.
    pub fn with_log(mut self, log: &'a JsonlTransitionLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn store(&self) -> &'a dyn TaskStore {
        self.store
    }

    /// Persist a new pending task already moved to running. Nothing is
    /// stored when the start fails.
    pub fn start(
        &self,
        ctx: &CancelToken,
        task: &mut Task,
        reason: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        ctx.check()?;
        let mut next = task.clone();
        let record = transition_at(&mut next, TaskStatus::Running, reason, Utc::now())?;
        self.store.create_task(&next)?;
        Ok(self.publish(task, next, record, Vec::new()))
    }

    pub fn transition(
        &self,
        ctx: &CancelToken,
        task: &mut Task,
        to: TaskStatus,
        reason: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        self.transition_with(ctx, task, to, reason, |_| {})
    }

    /// Like `transition`, with `update` applied to the pending copy before it
    /// is written.
    pub fn transition_with<F>(
        &self,
        ctx: &CancelToken,
        task: &mut Task,
        to: TaskStatus,
        reason: &str,
        update: F,
    ) -> Result<TransitionOutcome, EngineError>
    where
        F: FnOnce(&mut Task),
    {
        ctx.check()?;
        let mut next = task.clone();
        let record = transition_at(&mut next, to, reason, Utc::now())?;
        update(&mut next);
        self.commit(task, next, record, Vec::new())
    }

    /// Abandon `task`. Without `force` only error states qualify; with
    /// `force` a running task is also abandoned after its agent process is
    /// asked to terminate.
    pub fn abandon(
        &self,
        ctx: &CancelToken,
        task: &mut Task,
        force: bool,
        reason: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        ctx.check()?;
        if task.status == TaskStatus::Running && !force {
            return Err(EngineError::ForceRequired {
                task_id: task.id.clone(),
                status: task.status,
            });
        }

        let mut next = task.clone();
        let record = transition_at(&mut next, TaskStatus::Abandoned, reason, Utc::now())?;

        let mut diagnostics = Vec::new();
        if task.status == TaskStatus::Running {
            if let Some(failure) = self.terminate_agent(task) {
                diagnostics.push(failure);
            }
        }
        self.commit(task, next, record, diagnostics)
    }

    pub fn approve(
        &self,
        ctx: &CancelToken,
        task: &mut Task,
        reason: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        self.transition(ctx, task, TaskStatus::Completed, reason)
    }

    /// Final rejection. Non-blank feedback is kept in metadata.
    pub fn reject_done(
        &self,
        ctx: &CancelToken,
        task: &mut Task,
        feedback: Option<&str>,
    ) -> Result<TransitionOutcome, EngineError> {
        let feedback = feedback.map(str::trim).filter(|text| !text.is_empty());
        self.transition_with(ctx, task, TaskStatus::Rejected, "rejected", |next| {
            if let Some(text) = feedback {
                next.metadata
                    .insert(meta::REJECTION_FEEDBACK.to_string(), text.to_string());
            }
        })
    }

    /// Send an awaiting-approval task back to `running` at a resumable step.
    /// `step` is 1-indexed; `None` picks the implementation step.
    pub fn reject_retry(
        &self,
        ctx: &CancelToken,
        task: &mut Task,
        feedback: &str,
        step: Option<i64>,
    ) -> Result<TransitionOutcome, EngineError> {
        ctx.check()?;
        if feedback.trim().is_empty() {
            return Err(EngineError::EmptyFeedback {
                task_id: task.id.clone(),
            });
        }
        let step_index = resolve_retry_step(&task.steps, step).map_err(|len| {
            EngineError::StepOutOfRange {
                task_id: task.id.clone(),
                step: step.unwrap_or_default(),
                len,
            }
        })?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(StateMachineError::InvalidTransition {
                task_id: task.id.clone(),
                from: task.status,
                to: TaskStatus::Running,
            }
            .into());
        }

        self.store.save_artifact(
            &task.workspace,
            &task.id,
            artifact::REJECTION_FEEDBACK,
            feedback.as_bytes(),
        )?;

        let reason = match task.steps.get(step_index) {
            Some(resumed) => format!("rejected for retry at step {}", resumed.name),
            None => "rejected for retry".to_string(),
        };
        let mut next = task.clone();
        let record = transition_at(&mut next, TaskStatus::Running, &reason, Utc::now())?;
        next.current_step = step_index;
        next.metadata
            .insert(meta::REJECTION_FEEDBACK.to_string(), feedback.to_string());
        next.metadata
            .insert(meta::REJECTION_STEP.to_string(), step_index.to_string());
        self.commit(task, next, record, Vec::new())
    }

    fn terminate_agent(&self, task: &Task) -> Option<BestEffortFailure> {
        let raw = task.meta(meta::AGENT_PID)?;
        let Some(pid) = task.agent_pid() else {
            return Some(BestEffortFailure::record(
                BestEffortAction::TerminateProcess,
                format!("task {}: unparseable agent_pid '{raw}'", task.id),
            ));
        };
        match self.terminator.terminate(pid) {
            Ok(()) => {
                tracing::info!(task_id = %task.id, pid, "terminated agent process");
                None
            }
            Err(err) => Some(BestEffortFailure::record(
                BestEffortAction::TerminateProcess,
                format!("task {}: {err}", task.id),
            )),
        }
    }

    fn commit(
        &self,
        task: &mut Task,
        mut next: Task,
        record: TransitionRecord,
        diagnostics: Vec<BestEffortFailure>,
    ) -> Result<TransitionOutcome, EngineError> {
        next.version = self.store.update_task(&next)?;
        Ok(self.publish(task, next, record, diagnostics))
    }

    fn publish(
        &self,
        task: &mut Task,
        next: Task,
        record: TransitionRecord,
        mut diagnostics: Vec<BestEffortFailure>,
    ) -> TransitionOutcome {
        *task = next;
        tracing::info!(
            workspace = %task.workspace,
            task_id = %task.id,
            from = %record.from,
            to = %record.to,
            reason = %record.reason,
            "task transition"
        );

        if let Some(log) = self.log {
            let entry = TransitionLogEntry::new(&task.workspace, &task.id, &record);
            if let Err(err) = log.append(&entry) {
                diagnostics.push(BestEffortFailure::record(
                    BestEffortAction::MirrorTransitionLog,
                    err.to_string(),
                ));
            }
        }

        TransitionOutcome {
            record,
            diagnostics,
        }
    }
}

/// Resolve the 0-indexed step a retried task resumes at. An explicit step is
/// 1-indexed and must name an existing step; on failure the step count is
/// returned. Without one, the first step whose name mentions implementation
/// wins, falling back to the first step.
pub fn resolve_retry_step(steps: &[Step], step: Option<i64>) -> Result<usize, usize> {
    match step {
        Some(n) => usize::try_from(n)
            .ok()
            .filter(|n| (1..=steps.len()).contains(n))
            .map(|n| n - 1)
            .ok_or(steps.len()),
        None => Ok(steps
            .iter()
            .position(|step| {
                let name = step.name.to_lowercase();
                RESUME_STEP_KEYWORDS
                    .iter()
                    .any(|keyword| name.contains(keyword))
            })
            .unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use crate::store::TaskLister;
    use crate::testutil::{mk_task, RecordingTerminator};

    const STEPS: &[&str] = &["analyze", "implement", "validate"];

    fn stored(store: &SqliteStore, status: TaskStatus) -> Task {
        let task = mk_task("auth", "task-20260101-000000", status, STEPS);
        store.create_task(&task).expect("create task");
        task
    }

    /// Task store whose artifact writes always fail.
    struct NoArtifacts(SqliteStore);

    impl TaskLister for NoArtifacts {
        fn list_tasks(&self, workspace: &str) -> Result<Vec<Task>, PersistenceError> {
            self.0.list_tasks(workspace)
        }
    }

    impl TaskStore for NoArtifacts {
        fn create_task(&self, task: &Task) -> Result<(), PersistenceError> {
            self.0.create_task(task)
        }
        fn get_task(&self, workspace: &str, id: &TaskId) -> Result<Task, PersistenceError> {
            self.0.get_task(workspace, id)
        }
        fn update_task(&self, task: &Task) -> Result<u64, PersistenceError> {
            self.0.update_task(task)
        }
        fn save_artifact(
            &self,
            _workspace: &str,
            task_id: &TaskId,
            name: &str,
            _content: &[u8],
        ) -> Result<(), PersistenceError> {
            Err(PersistenceError::NotFound {
                entity: "artifact store",
                key: format!("{task_id}/{name}"),
            })
        }
        fn get_artifact(
            &self,
            workspace: &str,
            task_id: &TaskId,
            name: &str,
        ) -> Result<Vec<u8>, PersistenceError> {
            self.0.get_artifact(workspace, task_id, name)
        }
    }

    #[test]
    fn reject_retry_resumes_at_explicit_step() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = stored(&store, TaskStatus::AwaitingApproval);

        let outcome = engine
            .reject_retry(&CancelToken::new(), &mut task, "Fix auth", Some(2))
            .expect("reject retry");

        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.current_step, 1);
        assert_eq!(task.meta(meta::REJECTION_FEEDBACK), Some("Fix auth"));
        assert_eq!(task.meta(meta::REJECTION_STEP), Some("1"));
        assert_eq!(task.transitions.len(), 1);
        assert_eq!(outcome.record.from, TaskStatus::AwaitingApproval);
        assert_eq!(outcome.record.to, TaskStatus::Running);

        let persisted = store.get_task("auth", &task.id).unwrap();
        assert_eq!(persisted, task);
        assert_eq!(
            store
                .get_artifact("auth", &task.id, artifact::REJECTION_FEEDBACK)
                .unwrap(),
            b"Fix auth"
        );
    }

    #[test]
    fn reject_retry_defaults_to_implementation_step() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = stored(&store, TaskStatus::AwaitingApproval);

        engine
            .reject_retry(&CancelToken::new(), &mut task, "tighten the checks", None)
            .expect("reject retry");
        assert_eq!(task.current_step, 1);
    }

    #[test]
    fn reject_retry_validates_before_mutating() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = stored(&store, TaskStatus::AwaitingApproval);
        let before = task.clone();

        for step in [0, 4, -1] {
            let err = engine
                .reject_retry(&CancelToken::new(), &mut task, "Fix auth", Some(step))
                .expect_err("out of range");
            assert!(matches!(err, EngineError::StepOutOfRange { len: 3, .. }));
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        let err = engine
            .reject_retry(&CancelToken::new(), &mut task, "   ", Some(2))
            .expect_err("blank feedback");
        assert!(matches!(err, EngineError::EmptyFeedback { .. }));

        assert_eq!(task, before);
        assert!(store
            .get_artifact("auth", &task.id, artifact::REJECTION_FEEDBACK)
            .expect_err("nothing saved")
            .is_not_found());
    }

    #[test]
    fn reject_retry_requires_awaiting_approval() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = stored(&store, TaskStatus::CiFailed);

        let err = engine
            .reject_retry(&CancelToken::new(), &mut task, "Fix auth", None)
            .expect_err("wrong status");
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(task.status, TaskStatus::CiFailed);
    }

    #[test]
    fn failed_artifact_save_blocks_the_transition() {
        let store = NoArtifacts(SqliteStore::open_in_memory().unwrap());
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = mk_task("auth", "task-1", TaskStatus::AwaitingApproval, STEPS);
        store.create_task(&task).unwrap();
        let before = task.clone();

        engine
            .reject_retry(&CancelToken::new(), &mut task, "Fix auth", Some(2))
            .expect_err("artifact store down");
        assert_eq!(task, before);
        assert_eq!(
            store.get_task("auth", &task.id).unwrap().status,
            TaskStatus::AwaitingApproval
        );
    }

    #[test]
    fn plain_abandon_of_running_task_requires_force() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = stored(&store, TaskStatus::Running);

        let err = engine
            .abandon(&CancelToken::new(), &mut task, false, "give up")
            .expect_err("needs force");
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert!(err.to_string().contains("invalid transition"));
        assert!(err.to_string().contains("--force"));
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.transitions.is_empty());

        engine
            .abandon(&CancelToken::new(), &mut task, true, "give up")
            .expect("forced");
        assert_eq!(task.status, TaskStatus::Abandoned);
        assert_eq!(task.transitions.len(), 1);
        assert_eq!(
            store.get_task("auth", &task.id).unwrap().status,
            TaskStatus::Abandoned
        );
    }

    #[test]
    fn forced_abandon_terminates_the_tracked_agent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = mk_task("auth", "task-1", TaskStatus::Running, STEPS)
            .with_metadata(meta::AGENT_PID, "4242");
        store.create_task(&task).unwrap();

        let outcome = engine
            .abandon(&CancelToken::new(), &mut task, true, "stuck")
            .expect("forced");
        assert_eq!(*terminator.pids.borrow(), vec![4242]);
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn termination_failure_is_a_diagnostic_not_an_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::failing();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = mk_task("auth", "task-1", TaskStatus::Running, STEPS)
            .with_metadata(meta::AGENT_PID, "4242");
        store.create_task(&task).unwrap();

        let outcome = engine
            .abandon(&CancelToken::new(), &mut task, true, "stuck")
            .expect("abandoned regardless");
        assert_eq!(task.status, TaskStatus::Abandoned);
        assert_eq!(task.transitions.len(), 1);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(
            outcome.diagnostics[0].action,
            BestEffortAction::TerminateProcess
        );
    }

    #[test]
    fn abandon_from_error_states_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);

        for (idx, status) in TaskStatus::ALL.into_iter().enumerate() {
            let mut task = mk_task("auth", &format!("task-{idx}"), status, STEPS);
            store.create_task(&task).unwrap();
            let result = engine.abandon(&CancelToken::new(), &mut task, false, "done");
            assert_eq!(result.is_ok(), status.is_error(), "{status}");
            if !status.is_error() {
                assert_eq!(task.status, status);
            }
        }
        // Nothing was forced, so no process was signalled.
        assert!(terminator.pids.borrow().is_empty());
    }

    #[test]
    fn validating_task_cannot_be_force_abandoned() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = stored(&store, TaskStatus::Validating);

        let err = engine
            .abandon(&CancelToken::new(), &mut task, true, "stop")
            .expect_err("not force-abandonable");
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(task.status, TaskStatus::Validating);
    }

    #[test]
    fn approve_completes_awaiting_task() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = stored(&store, TaskStatus::AwaitingApproval);

        engine
            .approve(&CancelToken::new(), &mut task, "looks good")
            .expect("approve");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.version, 1);
    }

    #[test]
    fn reject_done_records_feedback() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = stored(&store, TaskStatus::AwaitingApproval);

        engine
            .reject_done(&CancelToken::new(), &mut task, Some("wrong approach"))
            .expect("reject");
        assert_eq!(task.status, TaskStatus::Rejected);
        assert_eq!(task.meta(meta::REJECTION_FEEDBACK), Some("wrong approach"));
    }

    #[test]
    fn stale_copy_cannot_overwrite_newer_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = stored(&store, TaskStatus::CiFailed);
        let mut stale = task.clone();

        engine
            .transition(&CancelToken::new(), &mut task, TaskStatus::Running, "retry")
            .expect("retry");
        let err = engine
            .abandon(&CancelToken::new(), &mut stale, false, "abandon")
            .expect_err("stale");
        assert!(matches!(
            err,
            EngineError::Store(PersistenceError::Conflict { .. })
        ));
        assert_eq!(stale.status, TaskStatus::CiFailed);
        assert_eq!(
            store.get_task("auth", &task.id).unwrap().status,
            TaskStatus::Running
        );
    }

    #[test]
    fn committed_transitions_are_mirrored_to_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlTransitionLog::new(dir.path());
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator).with_log(&log);
        let mut task = stored(&store, TaskStatus::Pending);

        engine
            .transition(&CancelToken::new(), &mut task, TaskStatus::Running, "start")
            .expect("start");
        let entries = log.read("auth", &task.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].to, TaskStatus::Running);
    }

    #[test]
    fn start_stores_the_task_already_running() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = mk_task("auth", "task-1", TaskStatus::Pending, STEPS);

        engine
            .start(&CancelToken::new(), &mut task, "task start")
            .expect("start");
        let stored = store.get_task("auth", &task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.transitions.len(), 1);
        assert_eq!(stored.transitions[0].from, TaskStatus::Pending);
        assert_eq!(stored, task);
    }

    #[test]
    fn cancelled_start_stores_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let terminator = RecordingTerminator::default();
        let engine = TaskEngine::new(&store, &terminator);
        let mut task = mk_task("auth", "task-1", TaskStatus::Pending, STEPS);
        let token = CancelToken::new();
        token.cancel();

        let err = engine
            .start(&token, &mut task, "task start")
            .expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(store.list_tasks("auth").unwrap().is_empty());
    }

    #[test]
    fn resolve_retry_step_cases() {
        let steps = |names: &[&str]| names.iter().map(|n| Step::new(*n)).collect::<Vec<_>>();

        assert_eq!(resolve_retry_step(&steps(STEPS), Some(3)), Ok(2));
        assert_eq!(resolve_retry_step(&steps(STEPS), Some(4)), Err(3));
        assert_eq!(
            resolve_retry_step(&steps(&["plan", "Write Code", "test"]), None),
            Ok(1)
        );
        assert_eq!(
            resolve_retry_step(&steps(&["plan", "Development", "test"]), None),
            Ok(1)
        );
        assert_eq!(resolve_retry_step(&steps(&["plan", "test"]), None), Ok(0));
        assert_eq!(resolve_retry_step(&[], None), Ok(0));
    }
}
