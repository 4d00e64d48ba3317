//! Crash analysis for worker processes.
//!
//! Turns a raw `WaitStatus` into an [`ExitStatus`] and, for abnormal ends,
//! a [`FailureRecord`].

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::result::ExitStatus;

/// How a worker that has left the running set actually ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Stopped, continued or still alive: not a termination.
    NotTerminated,
}

impl Termination {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Map to the status recorded on the task's result.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Exited(0) => ExitStatus::Success,
            Self::Exited(code) => ExitStatus::AbnormalExit(*code),
            Self::Signaled(signal) => ExitStatus::Killed(*signal as i32),
            Self::NotTerminated => ExitStatus::AbnormalExit(-1),
        }
    }
}

/// Analyze a `WaitStatus` to determine how the process ended.
pub fn analyze_wait_status(status: WaitStatus) -> Termination {
    match status {
        WaitStatus::Exited(_, code) => Termination::Exited(code),
        WaitStatus::Signaled(_, signal, _) => Termination::Signaled(signal),
        _ => Termination::NotTerminated,
    }
}

/// Why a worker failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FailureCause {
    ExitCode(i32),
    Signal(i32),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExitCode(code) => write!(f, "exit code {}", code),
            Self::Signal(signo) => match Signal::try_from(*signo) {
                Ok(signal) => write!(f, "signal {}", signal),
                Err(_) => write!(f, "signal {}", signo),
            },
        }
    }
}

/// Details of the most recent abnormal worker termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub pid: i32,
    pub task_id: u64,
    pub cause: FailureCause,
    pub tag: Option<String>,
}

impl FailureRecord {
    /// Build a record from a result status; `None` when the status is a success.
    pub fn from_status(
        pid: i32,
        task_id: u64,
        tag: Option<String>,
        status: ExitStatus,
    ) -> Option<Self> {
        let cause = match status {
            ExitStatus::Success => return None,
            ExitStatus::AbnormalExit(code) => FailureCause::ExitCode(code),
            ExitStatus::Killed(signo) => FailureCause::Signal(signo),
        };
        Some(Self {
            pid,
            task_id,
            cause,
            tag,
        })
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} (task #{}) terminated with {}",
            self.pid, self.task_id, self.cause
        )?;
        if let Some(tag) = &self.tag {
            write!(f, " [tag {}]", tag)?;
        }
        Ok(())
    }
}
