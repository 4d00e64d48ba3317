//! Handle for a forked child process.
//!
//! Unlike most process handles, dropping a [`ChildProc`] does nothing: a
//! copy of the handle may live in a forked descendant, and only the process
//! that created the child is allowed to signal or reap it. Teardown is
//! always an explicit call.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

use crate::error::{ForkPoolError, Result};

/// How long a child gets to exit after SIGTERM before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Poll interval while waiting for a child to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a child process of the current process.
#[derive(Debug)]
pub struct ChildProc {
    pid: Pid,
    reaped: bool,
}

impl ChildProc {
    pub fn new(pid: Pid) -> Self {
        Self { pid, reaped: false }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(ForkPoolError::Process(format!(
                "process {} already reaped",
                self.pid
            )));
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    self.reaped = true;
                    return Ok(status);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.reaped = true;
                    return Err(ForkPoolError::Process(format!(
                        "waitpid({}) failed: {}",
                        self.pid, e
                    )));
                }
            }
        }
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running. A process that was
    /// already reaped elsewhere (`ECHILD`) counts as exited.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(ForkPoolError::Process(format!(
                "process {} already reaped",
                self.pid
            )));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status))
            }
            Err(Errno::EINTR) => Ok(None),
            Err(Errno::ECHILD) => {
                self.reaped = true;
                Ok(Some(WaitStatus::Exited(self.pid, 0)))
            }
            Err(e) => Err(ForkPoolError::Process(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Send a signal unless the process has already been reaped.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ForkPoolError::Process(format!(
                "failed to send {} to {}: {}",
                sig, self.pid, e
            ))),
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        self.signal(Signal::SIGKILL)?;
        self.wait()?;
        Ok(())
    }

    /// Wait up to `timeout` for the process to exit on its own.
    ///
    /// Returns `true` once it has been reaped.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.reaped {
                return true;
            }
            match self.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                Err(_) => return self.reaped,
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Stop the process: SIGTERM, wait up to `grace`, then SIGKILL.
    pub fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.reaped || self.wait_timeout(Duration::ZERO) {
            return Ok(());
        }
        self.terminate()?;
        if self.wait_timeout(grace) {
            return Ok(());
        }
        self.kill()
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn spawn(cmd: &str, arg: &str) -> ChildProc {
        let child = Command::new(cmd).arg(arg).spawn().expect("spawn failed");
        ChildProc::new(Pid::from_raw(child.id() as i32))
    }

    #[test]
    fn test_wait_reports_exit_status() {
        let mut proc = spawn("sh", "-c");
        // `sh -c` without a command string exits non-zero.
        let status = proc.wait().unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, code) if code != 0));
        assert!(proc.is_reaped());
        assert!(proc.wait().is_err());
    }

    #[test]
    fn test_terminate_running_process() {
        let mut proc = spawn("sleep", "60");
        assert!(proc.is_running());

        proc.terminate().unwrap();
        let status = proc.wait().unwrap();
        assert_eq!(
            status,
            WaitStatus::Signaled(proc.pid(), Signal::SIGTERM, false)
        );
    }

    #[test]
    fn test_stop_escalates_and_reaps() {
        let mut proc = spawn("sleep", "60");
        proc.stop(Duration::from_millis(500)).unwrap();
        assert!(proc.is_reaped());
        assert!(!proc.is_running());
        // Signalling a reaped process is a no-op.
        proc.terminate().unwrap();
    }
}
