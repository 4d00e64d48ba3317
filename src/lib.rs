//! forkpool - run tasks in parallel across a bounded pool of forked processes.
//!
//! A [`ForkPool`] forks a dedicated master process the first time a task is
//! queued. The master forks one worker per task, keeps at most
//! `concurrency` of them running, and reports every outcome back to the
//! owner, which collects the results in the order the tasks were queued.
//!
//! Tasks are plain functions (or methods and closures over serializable data,
//! see [`Invocable`]) taking and returning `serde_json::Value`s. Whatever a
//! task prints to standard output is captured separately from its return
//! value. A worker that crashes, panics or exits early does not disturb its
//! siblings; it shows up as a failed [`TaskResult`] and sets
//! [`ForkPool::has_error`].
//!
//! Unix only. Every process in a pool is a `fork()` of the owner without
//! `exec()`.

pub mod config;
pub mod error;
pub mod fork_pool;
pub mod ipc;
pub mod log;
pub mod logging;
pub mod master;
pub mod pool;
pub mod proc;
pub mod protocol;
pub mod result;
pub mod signals;
pub mod spawn;
pub mod task;
pub mod termination;
pub mod transport;
pub mod worker;

pub use config::{Config, DEFAULT_CONCURRENCY};
pub use error::{ForkPoolError, Result};
pub use fork_pool::{ForkPool, Generator};
pub use log::{LogSink, Role, TracingSink};
pub use result::{Collection, ExitStatus, TaskResult};
pub use task::{Args, ClosureFn, Invocable, Receiver, TaskFn};
pub use termination::{FailureCause, FailureRecord};
pub use worker::{TASK_FAILURE_CODE, TASK_PANIC_CODE, TRANSPORT_FAILURE_CODE};
