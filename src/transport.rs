//! Per-task result slots.
//!
//! A worker shares no memory with the master, so it leaves its outcome in a
//! directory the master can read after reaping it. Each task gets two files
//! keyed by its id: the captured stdout (`task-<id>.out`, written directly by
//! the worker's fd 1) and a JSON report (`task-<id>.json`, written to a
//! temporary name and renamed so a reader never sees half of it).
//!
//! Slots are written once by a worker and taken once by the master. The
//! directory itself belongs to the owner, which removes it on shutdown.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::result::ExitStatus;

/// What a worker reports about its own task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub value: Value,
    pub status: ExitStatus,
    pub error: Option<String>,
}

/// Contents of a taken slot.
#[derive(Debug)]
pub struct Slot {
    /// The report, or why it could not be read.
    pub report: Result<WorkerReport, String>,
    pub output: String,
}

/// Directory holding every slot of one pool.
#[derive(Debug, Clone)]
pub struct SlotDir {
    path: PathBuf,
}

impl SlotDir {
    /// Create a fresh, uniquely named directory under the system temp dir.
    pub fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("forkpool-").tempdir()?;
        // Cleanup is explicit and owner-only, see `remove`.
        Ok(Self { path: dir.keep() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn output_path(&self, task_id: u64) -> PathBuf {
        self.path.join(format!("task-{}.out", task_id))
    }

    pub fn report_path(&self, task_id: u64) -> PathBuf {
        self.path.join(format!("task-{}.json", task_id))
    }

    /// Open the capture file a worker redirects its stdout into.
    pub fn open_output(&self, task_id: u64) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.output_path(task_id))
    }

    /// Publish a worker's report.
    pub fn write_report(&self, task_id: u64, report: &WorkerReport) -> io::Result<()> {
        let final_path = self.report_path(task_id);
        let tmp_path = final_path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path)?;
        serde_json::to_writer(&mut file, report)?;
        file.flush()?;
        fs::rename(&tmp_path, &final_path)
    }

    /// Read and remove a task's slot.
    ///
    /// A missing or unparsable report is returned as `Err` in
    /// [`Slot::report`]; the captured output is salvaged either way.
    pub fn take(&self, task_id: u64) -> Slot {
        let report_path = self.report_path(task_id);
        let report = match fs::read(&report_path) {
            Ok(bytes) => serde_json::from_slice::<WorkerReport>(&bytes)
                .map_err(|e| format!("corrupt result payload: {}", e)),
            Err(e) => Err(format!("missing result payload: {}", e)),
        };

        let output_path = self.output_path(task_id);
        let output = fs::read(&output_path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        let _ = fs::remove_file(&report_path);
        let _ = fs::remove_file(report_path.with_extension("json.tmp"));
        let _ = fs::remove_file(&output_path);

        Slot { report, output }
    }

    /// Delete the directory and everything left in it.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
