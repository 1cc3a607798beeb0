// src/monitor/exit_file.rs

//! Exit-file polling: a task is done once `{id}.exitCode` exists and is
//! non-empty.

use tracing::{debug, warn};

use crate::errors::Result;
use crate::fs::FileSystem;
use crate::task::{TaskId, TaskRegistry};

use super::{finish_from_report, ExitReport, PollOutcome};

#[derive(Debug, Default)]
pub struct ExitFileMonitor;

impl ExitFileMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Check every watched task for its exit file and finish the ones that
    /// have one.
    pub fn poll(
        &mut self,
        watched: &[TaskId],
        registry: &TaskRegistry,
        fs: &dyn FileSystem,
    ) -> Result<PollOutcome> {
        let mut outcome = PollOutcome::default();
        for id in watched {
            let Some(task) = registry.get(id) else {
                warn!(task = %id, "watched task is not registered");
                continue;
            };
            if task.is_done() {
                continue;
            }
            let path = &task.files().exit_code;
            if !fs.exists(path) {
                continue;
            }
            let text = fs.read_to_string(path)?;
            if text.trim().is_empty() {
                // Writer has created the file but not filled it yet.
                debug!(task = %id, "exit file still empty");
                continue;
            }
            let report = ExitReport::parse(&text);
            if finish_from_report(registry, id, &report)? {
                outcome.finished.push(id.clone());
            }
        }
        Ok(outcome)
    }
}
