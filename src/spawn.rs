//! Process forking.
//!
//! Every process in a pool is created here with a plain `fork()` and no
//! `exec()`, which is what lets task code travel as code addresses. The
//! child is put into its [`Role`] before anything else runs in it, and it
//! never returns into the caller's stack: whatever happens in the body, the
//! child ends in `_exit`.

use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use nix::unistd::{ForkResult, Pid, fork};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{ForkPoolError, Result};
use crate::log::Role;
use crate::signals;

/// Exit code of a child whose role could not be set up.
pub const SETUP_FAILURE_CODE: i32 = 70;

/// Exit code of a child whose body panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Holds SIGINT and SIGTERM blocked across a `fork()`.
///
/// A shutdown signal arriving between the fork and the child's own handler
/// setup would otherwise run the parent's handler in the child.
pub struct ForkGuard {
    previous: SigSet,
}

impl ForkGuard {
    pub fn block() -> Result<Self> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        set.add(Signal::SIGTERM);
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))
            .map_err(ForkPoolError::Signal)?;
        Ok(Self { previous })
    }

    /// Restore the signal mask from before [`ForkGuard::block`].
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ForkGuard {
    fn drop(&mut self) {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

/// Fork a child that runs `body` in `role` and exits with its return value.
///
/// In the parent, `body` is dropped without running, so anything it captured
/// by value (the child's ends of a channel, say) is closed there.
pub fn fork_process<F>(role: Role, body: F) -> Result<Pid>
where
    F: FnOnce() -> i32,
{
    // Anything still buffered would be written twice.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    let guard = ForkGuard::block()?;

    // SAFETY: the child only arms its signal handlers and runs `body` before
    // `_exit`; it never unwinds back into the caller.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            guard.release();
            drop(body);
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            let armed = match role {
                Role::Master => signals::arm_master(),
                Role::Worker => signals::reset_for_worker(),
                Role::Owner => Ok(()),
            };
            guard.release();

            let code = match armed {
                Ok(()) => panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(PANIC_EXIT_CODE),
                Err(_) => SETUP_FAILURE_CODE,
            };
            let _ = std::io::stdout().flush();
            // SAFETY: `_exit` skips atexit handlers and inherited stdio
            // buffers, which belong to the parent.
            unsafe { nix::libc::_exit(code) }
        }
        Err(e) => Err(ForkPoolError::Fork(e)),
    }
}
