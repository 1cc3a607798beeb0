// src/monitor/mod.rs

//! Completion monitors.
//!
//! An executioner picks one strategy:
//! - [`exit_file::ExitFileMonitor`] polls for `{id}.exitCode` files,
//! - [`queue::QueueMonitor`] drains a [`channel::MessageQueue`] fed by remote
//!   instances.
//!
//! Both finish tasks through the registry and report which tasks they
//! finished so the executioner can release their slots.

pub mod channel;
pub mod exit_file;
pub mod message;
pub mod queue;

use crate::errors::Result;
use crate::fs::FileSystem;
use crate::task::{TaskId, TaskRegistry, TaskState};

pub use channel::{MemoryQueue, MessageQueue, SpoolQueue};
pub use exit_file::ExitFileMonitor;
pub use message::{Message, MessageKind, OutputReporter};
pub use queue::QueueMonitor;

/// Exit-file text written when the wrapper's time limit is hit.
pub const EXIT_TIMEOUT: &str = "Time out";

/// Exit-file text written when the wrapper is signalled.
pub const EXIT_SIGNAL: &str = "Signal received";

/// Parsed content of an exit file or exit message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReport {
    Code(i32),
    TimedOut,
    Signaled,
    /// Anything else: an error text from the wrapper.
    Error(String),
}

impl ExitReport {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Ok(code) = text.parse::<i32>() {
            return ExitReport::Code(code);
        }
        if let Some(code) = text
            .strip_prefix("exit status ")
            .and_then(|c| c.trim().parse::<i32>().ok())
        {
            return ExitReport::Code(code);
        }
        if text == EXIT_TIMEOUT {
            return ExitReport::TimedOut;
        }
        if text == EXIT_SIGNAL || text.starts_with("signal:") {
            return ExitReport::Signaled;
        }
        ExitReport::Error(text.to_string())
    }

    /// Terminal state for this report.
    ///
    /// Any non-zero exit code is an error, including codes in the 128+N
    /// range that shells use for signal deaths; only an explicit signal
    /// report counts as killed.
    pub fn task_state(&self) -> TaskState {
        match self {
            ExitReport::Code(0) => TaskState::FinishedOk,
            ExitReport::Code(_) | ExitReport::TimedOut | ExitReport::Error(_) => {
                TaskState::FinishedError
            }
            ExitReport::Signaled => TaskState::FinishedKilled,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExitReport::Code(c) => Some(*c),
            _ => None,
        }
    }
}

/// Tasks a single poll touched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub finished: Vec<TaskId>,
    /// Tasks that went silent past the heartbeat timeout.
    pub stalled: Vec<TaskId>,
}

/// Completion strategy owned by one executioner.
#[derive(Debug)]
pub enum Monitor {
    ExitFile(ExitFileMonitor),
    Queue(QueueMonitor),
}

impl Monitor {
    pub fn poll(
        &mut self,
        watched: &[TaskId],
        registry: &TaskRegistry,
        fs: &dyn FileSystem,
    ) -> Result<PollOutcome> {
        match self {
            Monitor::ExitFile(m) => m.poll(watched, registry, fs),
            Monitor::Queue(m) => m.poll(watched, registry, fs),
        }
    }

    pub fn forget(&mut self, id: &str) {
        if let Monitor::Queue(m) = self {
            m.forget(id);
        }
    }
}

/// Apply an exit report to the registry. Returns `false` if the task was
/// already terminal.
pub(crate) fn finish_from_report(
    registry: &TaskRegistry,
    id: &str,
    report: &ExitReport,
) -> Result<bool> {
    let changed = registry.update(id, |task| {
        if task.is_done() {
            return Ok(false);
        }
        match report {
            ExitReport::TimedOut => {
                task.mark_timed_out();
                task.add_error("Task timed out");
            }
            ExitReport::Error(text) => task.add_error(text.clone()),
            _ => {}
        }
        task.finish(report.task_state(), report.exit_code())
            .map(|_| true)
    })??;
    Ok(changed)
}
