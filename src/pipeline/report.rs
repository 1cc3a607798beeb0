// src/pipeline/report.rs

//! End-of-run summary and fatal error display.

use std::fmt;
use std::time::Duration;

use crate::errors::PipelineError;
use crate::fs::FileSystem;
use crate::task::{Task, TaskId, TaskRegistry, TaskState};

/// STDERR lines shown for a task that aborted the pipeline.
pub const FATAL_STDERR_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub id: TaskId,
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub elapsed: Option<Duration>,
    pub up_to_date: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub tasks: Vec<TaskSummary>,
    /// Task failures that did not abort the run.
    pub failures: Vec<String>,
}

impl PipelineReport {
    pub fn from_registry(registry: &TaskRegistry, fs: &dyn FileSystem) -> Self {
        let mut report = PipelineReport::default();
        for mut task in registry.snapshot() {
            if let Some(err) = task.failure(fs) {
                report.failures.push(err.to_string());
            }
            report.tasks.push(TaskSummary {
                id: task.id.clone(),
                state: task.state(),
                exit_code: task.exit_code(),
                elapsed: task.elapsed(),
                up_to_date: task.is_up_to_date(),
                errors: task.errors().to_vec(),
            });
        }
        report
    }

    pub fn task(&self, id: &str) -> Option<&TaskSummary> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline report ({} tasks)", self.tasks.len())?;
        for t in &self.tasks {
            let exit = t
                .exit_code
                .map_or_else(|| "-".to_string(), |c| c.to_string());
            let elapsed = match (t.up_to_date, t.elapsed) {
                (true, _) => "up to date".to_string(),
                (false, Some(d)) => format!("{:.1}s", d.as_secs_f64()),
                (false, None) => "-".to_string(),
            };
            writeln!(f, "  {:<24} {:<20} exit={:<4} {}", t.id, t.state, exit, elapsed)?;
            for e in &t.errors {
                writeln!(f, "      {e}")?;
            }
        }
        if !self.failures.is_empty() {
            writeln!(f, "Non-fatal failures:")?;
            for failure in &self.failures {
                writeln!(f, "  {failure}")?;
            }
        }
        Ok(())
    }
}

/// Text printed when `task` aborts the pipeline with `err`.
pub fn fatal_message(err: &PipelineError, task: Option<&Task>, fs: &dyn FileSystem) -> String {
    let mut out = format!("Fatal error: {err}\n");
    if let Some(task) = task {
        out.push_str(&format!("  Task id : {}\n", task.id));
        out.push_str(&format!("  Command : {}\n", task.command.trim_end()));
        let tail = task.stderr_tail(fs, FATAL_STDERR_LINES);
        if !tail.is_empty() {
            out.push_str(&format!("  Stderr (last {FATAL_STDERR_LINES} lines):\n"));
            for line in tail.lines() {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use std::path::Path;

    #[test]
    fn fatal_message_shows_command_and_stderr_tail() {
        let fs = MockFileSystem::new();
        let task = Task::new("sort", "sort in.txt > out.txt", Path::new("/w"));
        let mut stderr = String::new();
        for i in 0..30 {
            stderr.push_str(&format!("line {i}\n"));
        }
        fs.add_file("/w/sort.stderr", stderr);
        let err = PipelineError::TaskFailed {
            task: "sort".into(),
            exit_code: 2,
        };

        let msg = fatal_message(&err, Some(&task), &fs);
        assert!(msg.contains("Task id : sort"));
        assert!(msg.contains("Command : sort in.txt > out.txt"));
        assert!(msg.contains("line 29"));
        assert!(msg.contains("line 10"));
        assert!(!msg.contains("line 9\n"));
    }

    #[test]
    fn report_lists_non_fatal_failures() {
        let fs = MockFileSystem::new();
        let registry = TaskRegistry::new();
        let mut t = Task::new("flaky", "false", Path::new("/w"));
        t.flags.can_fail = true;
        registry.add(t).unwrap();
        registry
            .update("flaky", |t| {
                t.transition(TaskState::Queued)?;
                t.transition(TaskState::Running)?;
                t.finish(TaskState::FinishedError, Some(1))
            })
            .unwrap()
            .unwrap();

        let report = PipelineReport::from_registry(&registry, &fs);
        assert_eq!(report.count(TaskState::FinishedError), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.to_string().contains("flaky"));
    }
}
