//! IPC protocol between the owner and the master.
//!
//! Messages are JSON-serialized and newline-delimited.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::TaskResult;
use crate::task::{Invocable, Task, WireInvocable};
use crate::termination::FailureRecord;

/// A task on its way from the owner to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: u64,
    pub tag: Option<String>,
    pub args: Vec<Value>,
    pub invocable: WireInvocable,
}

impl TaskRequest {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id(),
            tag: task.tag().map(String::from),
            args: task.args().to_vec(),
            invocable: WireInvocable::from(task.invocable()),
        }
    }

    /// Rebuild the task on the master side.
    ///
    /// # Safety
    /// The request must come from the process this one was forked from; see
    /// [`WireInvocable::into_invocable`].
    pub unsafe fn into_task(self) -> Task {
        let invocable: Invocable = unsafe { self.invocable.into_invocable() };
        Task::new(self.id, invocable, self.args.into(), self.tag)
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Notification from the master to the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterEvent {
    /// A worker was reaped and its result collected.
    Completed {
        result: TaskResult,
        failure: Option<FailureRecord>,
    },
}

impl MasterEvent {
    pub fn completed(result: TaskResult, failure: Option<FailureRecord>) -> Self {
        Self::Completed { result, failure }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
