//! Owner-side view of a pool.
//!
//! [`ProcessPool`] forks the master, sends it tasks and turns its events back
//! into an ordered [`Collection`]. Results can arrive in any order; a reorder
//! buffer holds each one until every task enqueued before it has been
//! released, so the collection and its tag index always follow enqueue order.
//!
//! Work is grouped into generations. A generation starts with the first
//! `enqueue` after a join and owns its own collection, tag set and error
//! state.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::unistd::Pid;

use crate::error::{ForkPoolError, Result};
use crate::ipc::{self, LineReader, LineWriter, Outbox};
use crate::log::{Log, Role};
use crate::master::Master;
use crate::proc::{ChildProc, SHUTDOWN_GRACE};
use crate::protocol::{MasterEvent, TaskRequest};
use crate::result::{Collection, TaskResult};
use crate::signals;
use crate::spawn;
use crate::task::Task;
use crate::termination::{FailureCause, FailureRecord};
use crate::transport::SlotDir;
use crate::worker::TRANSPORT_FAILURE_CODE;

/// Connection to a running master.
struct MasterHandle {
    proc: ChildProc,
    /// `None` once closed.
    tasks: Option<LineWriter>,
    events: LineReader,
    slots: SlotDir,
}

/// Bookkeeping for one generation of tasks.
#[derive(Debug, Default)]
struct Generation {
    /// Ids not yet released into the collection, in enqueue order.
    pending: VecDeque<u64>,
    /// Tags of tasks whose result has not arrived yet.
    in_flight: HashMap<u64, Option<String>>,
    /// Arrived results waiting for an earlier id.
    reorder: BTreeMap<u64, TaskResult>,
    collection: Collection,
}

impl Generation {
    fn admit(&mut self, task: &Task) {
        self.pending.push_back(task.id());
        self.in_flight
            .insert(task.id(), task.tag().map(String::from));
    }

    /// Accept a result. Returns `false` for ids this generation never saw.
    fn accept(&mut self, result: TaskResult) -> bool {
        if self.in_flight.remove(&result.task_id).is_none() {
            return false;
        }
        self.reorder.insert(result.task_id, result);
        while let Some(id) = self.pending.front().copied() {
            let Some(result) = self.reorder.remove(&id) else {
                break;
            };
            self.pending.pop_front();
            self.collection.push(result);
        }
        true
    }

    fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The owner's handle on a master and the results it reports.
pub struct ProcessPool {
    concurrency: usize,
    log: Log,
    master: Option<MasterHandle>,
    generation: Generation,
    error: Option<FailureRecord>,
}

impl ProcessPool {
    pub fn new(concurrency: usize, log: Log) -> Self {
        Self {
            concurrency,
            log,
            master: None,
            generation: Generation::default(),
            error: None,
        }
    }

    pub fn master_pid(&self) -> Option<Pid> {
        self.master.as_ref().map(|m| m.proc.pid())
    }

    /// Start a new generation: forget the previous results and error state.
    pub fn begin_generation(&mut self) {
        self.generation = Generation::default();
        self.error = None;
    }

    /// Make sure a live master is connected, forking one if needed.
    ///
    /// Returns the pid of a newly forked master.
    pub fn ensure_master(&mut self) -> Result<Option<Pid>> {
        if self.master.is_some() {
            self.absorb_available()?;
            if self.master.as_ref().is_some_and(|m| !m.events.is_eof()) {
                return Ok(None);
            }
            // The master died; everything it owed is already marked lost.
            self.shutdown();
        }
        self.start_master().map(Some)
    }

    fn start_master(&mut self) -> Result<Pid> {
        let slots = SlotDir::create()?;
        let (task_read, task_write) = ipc::pipe()?;
        let (event_read, event_write) = ipc::nonblocking_channel()?;

        let owner_task_fd = task_write.as_raw_fd();
        let owner_event_fd = event_read.as_raw_fd();
        let log = self.log.for_role(Role::Master);
        let concurrency = self.concurrency;
        let master_slots = slots.clone();

        let forked = spawn::fork_process(Role::Master, move || {
            // SAFETY: these are this process's inherited copies of the
            // owner's ends; nothing else here refers to them.
            unsafe {
                drop(OwnedFd::from_raw_fd(owner_task_fd));
                drop(OwnedFd::from_raw_fd(owner_event_fd));
            }
            Master::new(
                concurrency,
                log,
                master_slots,
                LineReader::new(task_read),
                Outbox::new(event_write),
            )
            .run()
        });
        let pid = match forked {
            Ok(pid) => pid,
            Err(e) => {
                let _ = slots.remove();
                return Err(e);
            }
        };

        self.log.info(format!("forked master process {}", pid));
        self.master = Some(MasterHandle {
            proc: ChildProc::new(pid),
            tasks: Some(LineWriter::new(task_write)),
            events: LineReader::new(event_read),
            slots,
        });
        Ok(pid)
    }

    /// Send a task to the master. Returns the number of tasks of the current
    /// generation still waiting for a result.
    ///
    /// With `new_generation`, the previous generation is discarded once the
    /// task has actually been handed over; a failed enqueue keeps it.
    pub fn enqueue(&mut self, task: &Task, new_generation: bool) -> Result<usize> {
        let line = TaskRequest::from_task(task).to_line()?;
        let writer = self
            .master
            .as_mut()
            .and_then(|m| m.tasks.as_mut())
            .ok_or_else(|| ForkPoolError::Enqueue("master is not running".to_string()))?;
        writer
            .write_line(&line)
            .map_err(|e| ForkPoolError::Enqueue(format!("master is unreachable: {}", e)))?;
        if new_generation {
            self.begin_generation();
        }
        self.generation.admit(task);
        Ok(self.generation.outstanding())
    }

    /// Process every event that has already arrived, without blocking.
    pub fn absorb_available(&mut self) -> Result<()> {
        signals::park_if_shutting_down();
        let Some(master) = self.master.as_mut() else {
            return Ok(());
        };
        master.events.fill_available()?;
        let mut events = Vec::new();
        while let Some(line) = master.events.next_line() {
            events.push(line);
        }
        let eof = master.events.is_eof();

        for line in events {
            match MasterEvent::from_line(&line) {
                Ok(event) => self.apply(event),
                Err(e) => self.log.error(format!("invalid event from master: {}", e)),
            }
        }
        if eof {
            // A master stopped by a shutdown signal owes nothing.
            signals::park_if_shutting_down();
            self.fail_outstanding();
        }
        Ok(())
    }

    /// Block until at least one event (or EOF) is available, then absorb.
    fn pump(&mut self) -> Result<()> {
        let Some(master) = self.master.as_ref() else {
            self.fail_outstanding();
            return Ok(());
        };
        if !master.events.is_eof() {
            ipc::wait_readable(master.events.as_fd(), None)?;
        }
        self.absorb_available()
    }

    fn apply(&mut self, event: MasterEvent) {
        match event {
            MasterEvent::Completed { result, failure } => {
                let task_id = result.task_id;
                if !self.generation.accept(result) {
                    self.log
                        .info(format!("ignoring result of task #{} from an earlier generation", task_id));
                    return;
                }
                if let Some(failure) = failure {
                    self.error = Some(failure);
                }
            }
        }
    }

    /// Mark every task still in flight as lost.
    fn fail_outstanding(&mut self) {
        if self.generation.outstanding() == 0 {
            return;
        }
        let pid = self.master_pid().map_or(0, Pid::as_raw);
        let mut lost: Vec<(u64, Option<String>)> = self
            .generation
            .in_flight
            .iter()
            .map(|(id, tag)| (*id, tag.clone()))
            .collect();
        lost.sort_by_key(|(id, _)| *id);

        self.log.error(format!(
            "master exited with {} task(s) outstanding",
            lost.len()
        ));
        for (id, tag) in lost {
            self.error = Some(FailureRecord {
                pid,
                task_id: id,
                cause: FailureCause::ExitCode(TRANSPORT_FAILURE_CODE),
                tag: tag.clone(),
            });
            self.generation
                .accept(TaskResult::lost(id, tag, "master exited before reporting"));
        }
    }

    /// Block until every task of the current generation has a result.
    pub fn wait(&mut self) -> Result<()> {
        while !self.generation.is_complete() {
            self.pump()?;
        }
        Ok(())
    }

    /// The `index`-th released result of the current generation, blocking
    /// until it is available. `None` once the generation is exhausted.
    pub fn released(&mut self, index: usize) -> Result<Option<&TaskResult>> {
        while self.generation.collection.len() <= index && !self.generation.is_complete() {
            self.pump()?;
        }
        Ok(self.generation.collection.get(index))
    }

    pub fn collection(&self) -> &Collection {
        &self.generation.collection
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&FailureRecord> {
        self.error.as_ref()
    }

    /// Close the task channel, stop the master and remove the slot
    /// directory. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        let Some(mut master) = self.master.take() else {
            return;
        };
        master.tasks = None;
        self.log
            .info(format!("shutting down master process {}", master.proc.pid()));
        if let Err(e) = master.proc.stop(SHUTDOWN_GRACE) {
            self.log.error(format!("failed to stop master: {}", e));
        }
        if let Err(e) = master.slots.remove() {
            self.log.error(format!(
                "failed to remove {}: {}",
                master.slots.path().display(),
                e
            ));
        }
    }
}
