//! Structured log lines for the pool.
//!
//! Every line carries the role and pid of the process that emitted it, so
//! output interleaved from the owner, master and workers stays readable.
//! The default [`TracingSink`] forwards to `tracing`; callers can plug in
//! their own [`LogSink`] through [`Config::with_logger`](crate::Config::with_logger).

use nix::unistd::{Pid, getpid};
use std::fmt;
use std::sync::Arc;

/// The part a process plays in the pool.
///
/// Set once at the point a process is forked into its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The process that constructed the pool.
    Owner,
    /// The forked process running the orchestration loop.
    Master,
    /// A forked process executing exactly one task.
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Destination for the pool's log lines.
pub trait LogSink: Send + Sync {
    fn info(&self, role: Role, pid: Pid, message: &str);
    fn error(&self, role: Role, pid: Pid, message: &str);
}

/// Default sink: emits `tracing` events with `role` and `pid` fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn info(&self, role: Role, pid: Pid, message: &str) {
        tracing::info!(role = %role, pid = pid.as_raw(), "{}", message);
    }

    fn error(&self, role: Role, pid: Pid, message: &str) {
        tracing::error!(role = %role, pid = pid.as_raw(), "{}", message);
    }
}

/// A sink bound to a role.
///
/// The pid is read at every call, so a copy inherited across `fork()` reports
/// the child's pid once the child has switched its role.
#[derive(Clone)]
pub struct Log {
    role: Role,
    sink: Arc<dyn LogSink>,
}

impl Log {
    pub fn new(role: Role, sink: Arc<dyn LogSink>) -> Self {
        Self { role, sink }
    }

    /// The same sink, relabelled for a freshly forked process.
    pub fn for_role(&self, role: Role) -> Self {
        Self {
            role,
            sink: Arc::clone(&self.sink),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.sink.info(self.role, getpid(), message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.sink.error(self.role, getpid(), message.as_ref());
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log").field("role", &self.role).finish()
    }
}
