//! The public pool type.

use nix::sys::signal::Signal;
use nix::unistd::{Pid, getpid};
use serde_json::Value;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{ForkPoolError, Result};
use crate::log::{Log, Role};
use crate::pool::ProcessPool;
use crate::result::Collection;
use crate::signals::{self, Registration, ShutdownTarget, SignalBridge};
use crate::task::{Args, Invocable, Task};
use crate::termination::FailureRecord;

const UNJOINED_MESSAGE: &str =
    "forkpool must wait for its child processes to complete; call ForkPool::wait() before dropping it";

/// A pool of forked worker processes.
///
/// Tasks are queued with [`fork`](Self::fork) and run in separate processes,
/// at most `concurrency` at a time. Results are read with [`get`](Self::get)
/// or streamed with [`generator`](Self::generator), always in the order the
/// tasks were queued.
///
/// A pool must be joined (by [`wait`](Self::wait), [`get`](Self::get) or an
/// exhausted [`generator`](Self::generator)) before it is dropped; dropping
/// it with tasks outstanding panics unless a shutdown signal was received.
///
/// ```no_run
/// use forkpool::{ForkPool, Invocable};
/// use serde_json::{Value, json};
///
/// fn square(args: &[Value]) -> anyhow::Result<Value> {
///     let n = args.first().and_then(Value::as_i64).unwrap_or(0);
///     Ok(json!(n * n))
/// }
///
/// let mut pool = ForkPool::with_concurrency(2)?;
/// for n in 1..=4_i64 {
///     pool.fork(Invocable::function(square), n, None)?;
/// }
/// let squares = pool.get(None)?.values();
/// assert_eq!(squares, vec![json!(1), json!(4), json!(9), json!(16)]);
/// # Ok::<(), forkpool::ForkPoolError>(())
/// ```
pub struct ForkPool {
    config: Config,
    log: Log,
    owner: Pid,
    pool: ProcessPool,
    target: Arc<ShutdownTarget>,
    _registration: Registration,
    next_task_id: u64,
    joined: bool,
}

impl ForkPool {
    /// Create a pool with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    /// Create a pool running at most `concurrency` workers at once.
    pub fn with_concurrency(concurrency: usize) -> Result<Self> {
        Self::with_config(Config::default().with_concurrency(concurrency)?)
    }

    pub fn with_config(config: Config) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(ForkPoolError::invalid_argument(
                "concurrency must be a positive integer",
            ));
        }
        let owner = getpid();
        let log = Log::new(Role::Owner, Arc::clone(&config.logger));
        let target = Arc::new(ShutdownTarget::new(log.clone()));
        let registration = SignalBridge::register(&target)?;

        log.info(format!(
            "pool created (owner {}, concurrency {})",
            owner, config.concurrency
        ));
        Ok(Self {
            pool: ProcessPool::new(config.concurrency, log.clone()),
            config,
            log,
            owner,
            target,
            _registration: registration,
            next_task_id: 1,
            joined: true,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// Queue `invocable` to run with `args` in a new worker process.
    ///
    /// The first successful call after a join starts a new generation:
    /// results, tags and the error state of the previous one are discarded.
    /// Returns the task's id.
    pub fn fork(
        &mut self,
        invocable: Invocable,
        args: impl Into<Args>,
        tag: Option<&str>,
    ) -> Result<u64> {
        if let Some(pid) = self.pool.ensure_master()? {
            self.target.set_master(Some(pid));
        }

        let id = self.next_task_id;
        self.next_task_id += 1;
        let task = Task::new(id, invocable, args.into(), tag.map(String::from));
        let depth = self.pool.enqueue(&task, self.joined)?;
        self.joined = false;

        self.log.info(format!(
            "queued task #{} ({}), queue depth {}",
            id,
            task.invocable().describe(),
            depth
        ));
        Ok(id)
    }

    /// Block until every queued task has finished. Idempotent.
    pub fn wait(&mut self) -> Result<()> {
        if self.joined {
            return Ok(());
        }
        self.pool.wait()?;
        self.joined = true;
        Ok(())
    }

    /// Results of the current generation, waiting for them first if needed.
    ///
    /// With a tag, only the results of tasks queued with that tag; a tag no
    /// task of this generation carried is an [`ForkPoolError::InvalidArgument`].
    pub fn get(&mut self, tag: Option<&str>) -> Result<Collection> {
        self.wait()?;
        let collection = self.pool.collection();
        match tag {
            None => Ok(collection.clone()),
            Some(tag) => collection
                .tagged(tag)
                .ok_or_else(|| ForkPoolError::invalid_argument(format!("unknown tag '{}'", tag))),
        }
    }

    /// Stream return values in queue order as they become available.
    pub fn generator(&mut self) -> Generator<'_> {
        Generator {
            pool: self,
            cursor: 0,
            done: false,
        }
    }

    /// Whether a worker of the current generation ended abnormally.
    pub fn has_error(&mut self) -> bool {
        self.absorb();
        self.pool.has_error()
    }

    /// The most recent abnormal termination of the current generation.
    pub fn error(&mut self) -> Option<FailureRecord> {
        self.absorb();
        self.pool.error().cloned()
    }

    fn absorb(&mut self) {
        if let Err(e) = self.pool.absorb_available() {
            self.log.error(format!("failed to read master events: {}", e));
        }
    }

    pub fn set_received_signal(&self, signal: Signal) {
        self.target.record(signal);
    }

    pub fn received_signal(&self) -> Option<Signal> {
        self.target.received()
    }

    pub fn owner_pid(&self) -> Pid {
        self.owner
    }

    /// Whether the current process is the one that created the pool.
    pub fn is_owner(&self) -> bool {
        getpid() == self.owner
    }

    pub fn master_pid(&self) -> Option<Pid> {
        self.pool.master_pid()
    }
}

impl std::fmt::Debug for ForkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkPool")
            .field("owner", &self.owner)
            .field("concurrency", &self.config.concurrency)
            .field("master", &self.pool.master_pid())
            .field("joined", &self.joined)
            .finish()
    }
}

impl Drop for ForkPool {
    fn drop(&mut self) {
        // Forked copies of the pool own nothing.
        if !self.is_owner() {
            return;
        }
        // The signal watcher owns teardown from here.
        signals::park_if_shutting_down();
        self.pool.shutdown();
        self.target.set_master(None);

        if !self.joined && self.received_signal().is_none() {
            self.log.error(UNJOINED_MESSAGE);
            if !std::thread::panicking() {
                panic!("{}", UNJOINED_MESSAGE);
            }
        }
    }
}

/// Iterator over return values in queue order; see [`ForkPool::generator`].
pub struct Generator<'a> {
    pool: &'a mut ForkPool,
    cursor: usize,
    done: bool,
}

impl Iterator for Generator<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if self.done {
            return None;
        }
        let next = self
            .pool
            .pool
            .released(self.cursor)
            .map(|result| result.map(|r| r.value.clone()));
        match next {
            Ok(Some(value)) => {
                self.cursor += 1;
                Some(value)
            }
            Ok(None) => {
                self.done = true;
                self.pool.joined = true;
                None
            }
            Err(e) => {
                self.pool
                    .log
                    .error(format!("generator stopped: {}", e));
                self.done = true;
                None
            }
        }
    }
}
