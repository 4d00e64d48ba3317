//! The master process: admission, worker forking and reaping.
//!
//! The master reads tasks from the owner, keeps at most `concurrency`
//! workers alive, and reports each reaped worker back as a
//! [`MasterEvent`]. It never blocks on the owner: events go through an
//! [`Outbox`], and the task channel is polled with a short timeout so
//! reaping keeps going while the owner is busy.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpgrp, getpid, setpgid};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::ipc::{self, LineReader, Outbox};
use crate::log::{Log, Role};
use crate::proc::{ChildProc, SHUTDOWN_GRACE};
use crate::protocol::{MasterEvent, TaskRequest};
use crate::result::{ExitStatus, TaskResult};
use crate::signals;
use crate::spawn;
use crate::task::Task;
use crate::termination::{FailureRecord, Termination, analyze_wait_status};
use crate::transport::{Slot, SlotDir};
use crate::worker::{self, TRANSPORT_FAILURE_CODE};

/// How long the master waits for new tasks before reaping again.
pub const REAP_INTERVAL_MS: u16 = 10;

/// Orchestration state of the master process.
pub struct Master {
    concurrency: usize,
    log: Log,
    slots: SlotDir,
    tasks: LineReader,
    events: Outbox,
    queue: VecDeque<Task>,
    running: HashMap<Pid, Task>,
}

impl Master {
    pub fn new(
        concurrency: usize,
        log: Log,
        slots: SlotDir,
        tasks: LineReader,
        events: Outbox,
    ) -> Self {
        Self {
            concurrency: concurrency.max(1),
            log,
            slots,
            tasks,
            events,
            queue: VecDeque::new(),
            running: HashMap::new(),
        }
    }

    /// Run until the owner closes the task channel and everything is
    /// reported, or until a shutdown signal arrives. Returns the exit code.
    pub fn run(mut self) -> i32 {
        // Own process group, so shutdown can reach every worker at once.
        if let Err(e) = setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
            self.log.error(format!("setpgid failed: {}", e));
        }
        self.log
            .info(format!("master started (concurrency {})", self.concurrency));

        loop {
            if let Some(signal) = signals::master_shutdown_requested() {
                self.shut_down(signal);
                return 0;
            }

            self.dispatch();
            self.reap();

            if let Err(e) = self.events.flush_available() {
                self.log
                    .error(format!("owner is gone ({}), stopping workers", e));
                self.shut_down(Signal::SIGTERM);
                return 1;
            }

            if self.is_finished() {
                break;
            }
            self.receive_tasks();
        }

        self.log.info("master finished");
        0
    }

    fn is_finished(&self) -> bool {
        self.tasks.is_eof()
            && self.queue.is_empty()
            && self.running.is_empty()
            && self.events.is_empty()
    }

    /// Pull whatever the owner has sent, waiting at most one reap interval.
    fn receive_tasks(&mut self) {
        if self.tasks.is_eof() {
            std::thread::sleep(Duration::from_millis(u64::from(REAP_INTERVAL_MS)));
            return;
        }
        match ipc::wait_readable(self.tasks.as_fd(), Some(REAP_INTERVAL_MS)) {
            Ok(true) => {
                if let Err(e) = self.tasks.fill() {
                    self.log.error(format!("task channel read failed: {}", e));
                    return;
                }
            }
            Ok(false) => return,
            Err(e) => {
                self.log.error(format!("poll on task channel failed: {}", e));
                return;
            }
        }

        while let Some(line) = self.tasks.next_line() {
            match TaskRequest::from_line(&line) {
                // SAFETY: requests only come from the owner this process was
                // forked from.
                Ok(request) => self.queue.push_back(unsafe { request.into_task() }),
                Err(e) => self.log.error(format!("invalid task request: {}", e)),
            }
        }
    }

    /// Fork workers for queued tasks while there is room.
    fn dispatch(&mut self) {
        while self.running.len() < self.concurrency {
            let Some(task) = self.queue.pop_front() else {
                break;
            };

            let slots = self.slots.clone();
            let child_task = task.clone();
            match spawn::fork_process(Role::Worker, move || {
                worker::run_worker(&child_task, &slots)
            }) {
                Ok(pid) => {
                    self.log.info(format!(
                        "forked worker {} for task #{} ({})",
                        pid,
                        task.id(),
                        task.invocable().describe()
                    ));
                    self.running.insert(pid, task);
                }
                Err(e) if !self.running.is_empty() => {
                    // Retry once a running worker has freed its resources.
                    self.log
                        .error(format!("fork failed for task #{}: {}, retrying", task.id(), e));
                    self.queue.push_front(task);
                    break;
                }
                Err(e) => {
                    self.log
                        .error(format!("fork failed for task #{}: {}", task.id(), e));
                    let result = TaskResult::lost(
                        task.id(),
                        task.tag().map(String::from),
                        format!("could not fork a worker: {}", e),
                    );
                    self.report(result);
                }
            }
        }
    }

    /// Collect every worker that has exited.
    fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else { continue };
                    let termination = analyze_wait_status(status);
                    if termination == Termination::NotTerminated {
                        continue;
                    }
                    if let Some(task) = self.running.remove(&pid) {
                        self.collect(pid, task, termination);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    self.log.error(format!("waitpid failed: {}", e));
                    break;
                }
            }
        }
    }

    fn collect(&mut self, pid: Pid, task: Task, termination: Termination) {
        let slot = self.slots.take(task.id());
        let result = build_result(pid, &task, termination, slot);
        if result.is_success() {
            self.log
                .info(format!("reaped worker {} (task #{})", pid, task.id()));
        }
        self.report(result);
    }

    fn report(&mut self, result: TaskResult) {
        let failure = FailureRecord::from_status(
            result.pid,
            result.task_id,
            result.tag.clone(),
            result.status,
        );
        if let Some(failure) = &failure {
            self.log.error(failure.to_string());
        }
        match MasterEvent::completed(result, failure).to_line() {
            Ok(line) => self.events.push_line(&line),
            Err(e) => self.log.error(format!("failed to encode event: {}", e)),
        }
    }

    /// Terminate every worker and reap them, escalating to SIGKILL after
    /// the grace period.
    fn shut_down(&mut self, signal: Signal) {
        self.log.info(format!(
            "received signal {}, terminating {} worker(s)",
            signal,
            self.running.len()
        ));

        if getpgrp() == getpid() {
            // Includes this process; its handler only records the signal.
            let _ = signal::killpg(getpgrp(), Signal::SIGTERM);
        } else {
            for pid in self.running.keys() {
                let _ = ChildProc::new(*pid).terminate();
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.running.is_empty() && Instant::now() < deadline {
            self.reap();
            std::thread::sleep(Duration::from_millis(u64::from(REAP_INTERVAL_MS)));
        }

        for (pid, task) in self.running.drain() {
            self.log.error(format!(
                "worker {} (task #{}) ignored SIGTERM, killing",
                pid,
                task.id()
            ));
            let _ = ChildProc::new(pid).kill();
        }
        self.queue.clear();
        self.log.info("master shutdown complete");
    }
}

/// Combine how a worker ended with what it reported.
pub(crate) fn build_result(pid: Pid, task: &Task, termination: Termination, slot: Slot) -> TaskResult {
    let (value, status, error) = match (termination, slot.report) {
        (Termination::Exited(0), Ok(report)) => (report.value, report.status, report.error),
        (Termination::Exited(0), Err(reason)) => (
            Value::Null,
            ExitStatus::AbnormalExit(TRANSPORT_FAILURE_CODE),
            Some(reason),
        ),
        (ended, Ok(report)) => (report.value, ended.exit_status(), report.error),
        (ended, Err(_)) => (Value::Null, ended.exit_status(), None),
    };
    TaskResult {
        task_id: task.id(),
        tag: task.tag().map(String::from),
        pid: pid.as_raw(),
        value,
        output: slot.output,
        status,
        error,
    }
}
