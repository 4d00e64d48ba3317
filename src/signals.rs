//! Shutdown signals for the three process roles.
//!
//! * **Owner**: SIGINT and SIGTERM are caught by a minimal handler that only
//!   marks the owner as shutting down and wakes a watcher thread through a
//!   self-pipe. The watcher does the real work outside signal context: it
//!   tells every live pool in the process, sends SIGTERM to their masters and
//!   exits with `128 + signo`. Pool calls made by other threads from then on
//!   park instead of returning, see [`park_if_shutting_down`].
//! * **Master**: the handler records the signal; the master loop polls it.
//! * **Worker**: default dispositions, so a signal simply ends the worker.
//!
//! The owner handler checks the pid it was installed for, so a forked copy
//! that has not re-armed yet never acts on the owner's behalf.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{Pid, getpid};
use std::ffi::c_int;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::{ForkPoolError, Result};
use crate::ipc::{self, PipeFd};
use crate::log::Log;
use crate::proc::ChildProc;

/// Signals that trigger shutdown.
pub const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Name of the owner's watcher thread.
pub const WATCHER_THREAD_NAME: &str = "forkpool-signals";

/// Lifecycle of the owner's signal bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Running,
    ShuttingDown,
    Terminated,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            SHUTTING_DOWN => Self::ShuttingDown,
            TERMINATED => Self::Terminated,
            _ => Self::Running,
        }
    }
}

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const TERMINATED: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(RUNNING);

/// Pid the owner handler was installed for (0 = never installed).
static INSTALLED_FOR: AtomicI32 = AtomicI32::new(0);

/// Write end of the watcher's wake channel (-1 = none).
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Signal recorded by the master handler (0 = none).
static MASTER_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Live pools of this process.
static TARGETS: Mutex<Vec<Weak<ShutdownTarget>>> = Mutex::new(Vec::new());

pub fn bridge_state() -> BridgeState {
    BridgeState::from_u8(STATE.load(Ordering::SeqCst))
}

/// Park the calling thread for good if this process is an owner that has
/// received a shutdown signal.
///
/// The watcher thread exits the process; until then no pool call may return
/// results that only exist because the master is being torn down.
pub fn park_if_shutting_down() {
    if bridge_state() == BridgeState::Running
        || INSTALLED_FOR.load(Ordering::SeqCst) != getpid().as_raw()
    {
        return;
    }
    loop {
        std::thread::park();
    }
}

fn set_state(state: BridgeState) {
    let value = match state {
        BridgeState::Running => RUNNING,
        BridgeState::ShuttingDown => SHUTTING_DOWN,
        BridgeState::Terminated => TERMINATED,
    };
    STATE.store(value, Ordering::SeqCst);
}

fn targets() -> MutexGuard<'static, Vec<Weak<ShutdownTarget>>> {
    TARGETS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the watcher needs to know about one pool.
#[derive(Debug)]
pub struct ShutdownTarget {
    log: Log,
    /// Master pid, 0 while there is none.
    master: AtomicI32,
    /// Recorded shutdown signal, 0 while there is none.
    received: AtomicI32,
}

impl ShutdownTarget {
    pub fn new(log: Log) -> Self {
        Self {
            log,
            master: AtomicI32::new(0),
            received: AtomicI32::new(0),
        }
    }

    pub fn set_master(&self, pid: Option<Pid>) {
        self.master
            .store(pid.map_or(0, Pid::as_raw), Ordering::SeqCst);
    }

    pub fn master(&self) -> Option<Pid> {
        match self.master.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    pub fn record(&self, signal: Signal) {
        self.received.store(signal as i32, Ordering::SeqCst);
    }

    pub fn received(&self) -> Option<Signal> {
        match self.received.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }

    /// Tell this pool about `signal` and forward SIGTERM to its master.
    ///
    /// The master escalates to its workers on its own; nothing here waits.
    fn shut_down(&self, signal: Signal) {
        self.log.info(format!("received signal {}", signal));
        self.record(signal);
        if let Some(pid) = self.master() {
            self.log
                .info(format!("--> forwarding SIGTERM to master {}", pid));
            if let Err(e) = ChildProc::new(pid).terminate() {
                self.log.error(format!("failed to signal master: {}", e));
            }
            self.set_master(None);
        }
        self.log.info("<-- signal handling has been completed");
    }
}

/// Owner-side signal handling, shared by every pool of a process.
pub struct SignalBridge;

impl SignalBridge {
    /// Register a pool, installing the owner handlers first if this process
    /// has not done so yet.
    pub fn register(target: &Arc<ShutdownTarget>) -> Result<Registration> {
        let mut registry = targets();
        let pid = getpid().as_raw();
        if INSTALLED_FOR.load(Ordering::SeqCst) != pid {
            // Entries inherited across fork belong to the parent.
            registry.clear();
            Self::install(pid)?;
        }
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(target));
        Ok(Registration {
            target: Arc::downgrade(target),
            pid,
        })
    }

    fn install(pid: i32) -> Result<()> {
        let (wake_read, wake_write) = ipc::nonblocking_channel()?;
        std::thread::Builder::new()
            .name(WATCHER_THREAD_NAME.to_string())
            .spawn(move || watch(wake_read))?;

        // The write end lives as long as the process.
        WAKE_FD.store(wake_write.into_raw_fd(), Ordering::SeqCst);
        INSTALLED_FOR.store(pid, Ordering::SeqCst);
        set_state(BridgeState::Running);

        let action = SigAction::new(
            SigHandler::Handler(on_owner_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in SHUTDOWN_SIGNALS {
            // SAFETY: the handler only touches atomics and calls write(2).
            unsafe { signal::sigaction(sig, &action) }.map_err(ForkPoolError::Signal)?;
        }
        Ok(())
    }
}

/// Keeps a pool registered with the bridge; unregisters on drop.
#[derive(Debug)]
pub struct Registration {
    target: Weak<ShutdownTarget>,
    pid: i32,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if getpid().as_raw() != self.pid {
            return;
        }
        targets().retain(|weak| weak.strong_count() > 0 && !weak.ptr_eq(&self.target));
    }
}

extern "C" fn on_owner_signal(signo: c_int) {
    if getpid().as_raw() != INSTALLED_FOR.load(Ordering::SeqCst) {
        return;
    }
    STATE.store(SHUTTING_DOWN, Ordering::SeqCst);
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    // SAFETY: WAKE_FD is never closed once stored.
    let wake = unsafe { BorrowedFd::borrow_raw(fd) };
    let _ = nix::unistd::write(wake, &[signo as u8]);
}

fn watch(mut wake: PipeFd) {
    let mut byte = [0u8; 1];
    let signo = loop {
        if ipc::wait_readable(wake.as_fd(), None).is_err() {
            return;
        }
        match wake.read(&mut byte) {
            Ok(1) => break i32::from(byte[0]),
            Ok(_) => return,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(_) => return,
        }
    };
    let Ok(signal) = Signal::try_from(signo) else {
        return;
    };

    set_state(BridgeState::ShuttingDown);
    let live: Vec<Arc<ShutdownTarget>> = targets().iter().filter_map(Weak::upgrade).collect();
    for target in live {
        target.shut_down(signal);
    }
    set_state(BridgeState::Terminated);
    std::process::exit(128 + signo);
}

extern "C" fn on_master_signal(signo: c_int) {
    MASTER_SIGNAL.store(signo, Ordering::SeqCst);
}

/// Install the master's handlers. Called in the child right after fork.
///
/// No `SA_RESTART`, so a signal interrupts the master's poll immediately.
pub fn arm_master() -> nix::Result<()> {
    MASTER_SIGNAL.store(0, Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(on_master_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in SHUTDOWN_SIGNALS {
        // SAFETY: the handler only stores to an atomic.
        unsafe { signal::sigaction(sig, &action) }?;
    }
    // A vanished owner shows up as EPIPE instead.
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }?;
    Ok(())
}

/// The shutdown signal the master has received, if any.
pub fn master_shutdown_requested() -> Option<Signal> {
    match MASTER_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

/// Restore default dispositions in a worker.
pub fn reset_for_worker() -> nix::Result<()> {
    for sig in SHUTDOWN_SIGNALS {
        // SAFETY: restoring the default disposition.
        unsafe { signal::signal(sig, SigHandler::SigDfl) }?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Role, TracingSink};

    fn target() -> Arc<ShutdownTarget> {
        Arc::new(ShutdownTarget::new(Log::new(Role::Owner, Arc::new(TracingSink))))
    }

    #[test]
    fn test_shutdown_target_records() {
        let target = target();
        assert_eq!(target.received(), None);
        assert_eq!(target.master(), None);

        target.record(Signal::SIGINT);
        target.set_master(Some(Pid::from_raw(4242)));
        assert_eq!(target.received(), Some(Signal::SIGINT));
        assert_eq!(target.master(), Some(Pid::from_raw(4242)));

        target.set_master(None);
        assert_eq!(target.master(), None);
    }

    #[test]
    fn test_registration_lifecycle() {
        let target = target();
        let registration = SignalBridge::register(&target).unwrap();
        assert_eq!(INSTALLED_FOR.load(Ordering::SeqCst), getpid().as_raw());
        assert_eq!(bridge_state(), BridgeState::Running);
        assert!(targets().iter().any(|w| w.ptr_eq(&Arc::downgrade(&target))));

        drop(registration);
        assert!(!targets().iter().any(|w| w.ptr_eq(&Arc::downgrade(&target))));
    }

    #[test]
    fn test_running_owner_does_not_park() {
        let target = target();
        let _registration = SignalBridge::register(&target).unwrap();
        assert_eq!(bridge_state(), BridgeState::Running);
        park_if_shutting_down();
    }

    #[test]
    fn test_bridge_state_encoding() {
        for state in [
            BridgeState::Running,
            BridgeState::ShuttingDown,
            BridgeState::Terminated,
        ] {
            let value = match state {
                BridgeState::Running => RUNNING,
                BridgeState::ShuttingDown => SHUTTING_DOWN,
                BridgeState::Terminated => TERMINATED,
            };
            assert_eq!(BridgeState::from_u8(value), state);
        }
    }
}
