//! Terminating the agent process recorded on a task.

#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },
    #[error("pid {0} cannot be signalled")]
    InvalidPid(u32),
    #[error("process termination is not supported on this platform")]
    Unsupported,
}

pub trait ProcessTerminator {
    /// Ask `pid` to exit. A process that is already gone counts as success.
    fn terminate(&self, pid: u32) -> Result<(), TerminateError>;
}

/// Sends SIGTERM.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalTerminator;

#[cfg(unix)]
impl ProcessTerminator for SignalTerminator {
    fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // 0 and values past i32::MAX would address process groups.
        let raw = i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .ok_or(TerminateError::InvalidPid(pid))?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => {
                tracing::debug!(pid, "sent SIGTERM");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                tracing::debug!(pid, "process already exited");
                Ok(())
            }
            Err(errno) => Err(TerminateError::Signal {
                pid,
                message: errno.desc().to_string(),
            }),
        }
    }
}

#[cfg(not(unix))]
impl ProcessTerminator for SignalTerminator {
    fn terminate(&self, _pid: u32) -> Result<(), TerminateError> {
        Err(TerminateError::Unsupported)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn terminates_a_child_process() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        SignalTerminator.terminate(child.id()).expect("terminate");
        let status = child.wait().expect("wait");
        assert!(!status.success());
    }

    #[test]
    fn rejects_pid_zero() {
        let err = SignalTerminator.terminate(0).expect_err("pid 0");
        assert!(matches!(err, TerminateError::InvalidPid(0)));
    }
}
