//! Task outcomes and the tag-indexed collection they are gathered into.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::ops::Index;

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    /// Non-zero exit code, or a task that returned an error.
    AbnormalExit(i32),
    /// Killed by the given signal number.
    Killed(i32),
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::AbnormalExit(code) => write!(f, "exited with code {}", code),
            Self::Killed(signo) => write!(f, "killed by signal {}", signo),
        }
    }
}

/// Outcome of one executed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: u64,
    pub tag: Option<String>,
    /// Pid of the worker that ran the task (0 if it never ran).
    pub pid: i32,
    pub value: Value,
    /// Everything the task wrote to standard output.
    pub output: String,
    pub status: ExitStatus,
    /// Error reported by the task, or why its result could not be read.
    pub error: Option<String>,
}

impl TaskResult {
    /// Result for a task whose outcome never reached the owner.
    pub fn lost(task_id: u64, tag: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            tag,
            pid: 0,
            value: Value::Null,
            output: String::new(),
            status: ExitStatus::AbnormalExit(crate::worker::TRANSPORT_FAILURE_CODE),
            error: Some(reason.into()),
        }
    }

    pub fn return_value(&self) -> &Value {
        &self.value
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Results in task-enqueue order, with a per-tag index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    results: Vec<TaskResult>,
    by_tag: HashMap<String, Vec<usize>>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result. Callers append in enqueue order.
    pub fn push(&mut self, result: TaskResult) {
        if let Some(tag) = &result.tag {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .push(self.results.len());
        }
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TaskResult> {
        self.results.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskResult> {
        self.results.iter()
    }

    /// Raw return values in order.
    pub fn values(&self) -> Vec<Value> {
        self.results.iter().map(|r| r.value.clone()).collect()
    }

    /// Captured outputs in order.
    pub fn outputs(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.output.as_str()).collect()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    /// Tags present in the collection, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.by_tag.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// The subsequence of results carrying `tag`, or `None` if none do.
    pub fn tagged(&self, tag: &str) -> Option<Collection> {
        let indices = self.by_tag.get(tag)?;
        let mut view = Collection::new();
        for &i in indices {
            view.push(self.results[i].clone());
        }
        Some(view)
    }

    pub fn into_vec(self) -> Vec<TaskResult> {
        self.results
    }
}

impl Index<usize> for Collection {
    type Output = TaskResult;

    fn index(&self, index: usize) -> &TaskResult {
        &self.results[index]
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a TaskResult;
    type IntoIter = std::slice::Iter<'a, TaskResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

impl IntoIterator for Collection {
    type Item = TaskResult;
    type IntoIter = std::vec::IntoIter<TaskResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}
