//! Worker process body.
//!
//! A worker runs exactly one task. Its standard output is redirected into the
//! task's capture file before the task starts, and its outcome is written to
//! the task's report slot before it exits. The exit code mirrors the report so
//! the master can tell a clean run from a crash even without reading it.

use serde_json::Value;
use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};

use crate::result::ExitStatus;
use crate::task::Task;
use crate::transport::{SlotDir, WorkerReport};

/// Exit code of a task that returned an error.
pub const TASK_FAILURE_CODE: i32 = 1;

/// Exit code of a task that panicked.
pub const TASK_PANIC_CODE: i32 = 101;

/// Exit code when a task's result could not be delivered (EX_IOERR).
pub const TRANSPORT_FAILURE_CODE: i32 = 74;

/// Run `task` in the current (freshly forked) process.
///
/// Returns the exit code the worker should `_exit` with.
pub fn run_worker(task: &Task, slots: &SlotDir) -> i32 {
    let capture = match slots.open_output(task.id()) {
        Ok(file) => file,
        Err(_) => return TRANSPORT_FAILURE_CODE,
    };
    if nix::unistd::dup2_stdout(&capture).is_err() {
        return TRANSPORT_FAILURE_CODE;
    }
    drop(capture);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
    let _ = io::stdout().flush();

    let report = match outcome {
        Ok(Ok(value)) => WorkerReport {
            value,
            status: ExitStatus::Success,
            error: None,
        },
        Ok(Err(e)) => WorkerReport {
            value: Value::Null,
            status: ExitStatus::AbnormalExit(TASK_FAILURE_CODE),
            error: Some(format!("{:#}", e)),
        },
        Err(payload) => WorkerReport {
            value: Value::Null,
            status: ExitStatus::AbnormalExit(TASK_PANIC_CODE),
            error: Some(panic_message(payload.as_ref())),
        },
    };

    let code = match report.status {
        ExitStatus::AbnormalExit(code) => code,
        _ => 0,
    };
    match slots.write_report(task.id(), &report) {
        Ok(()) => code,
        Err(_) => TRANSPORT_FAILURE_CODE,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}
