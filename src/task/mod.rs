// src/task/mod.rs

//! Tasks: the unit of schedulable work.
//!
//! - [`state`] is the lifecycle state machine.
//! - [`dependency`] holds declared inputs/outputs and the staleness rule.
//! - [`registry`] is the shared task table with the output -> producer index.
//! - [`resources`] is the per-task key/value resource request.

pub mod dependency;
pub mod registry;
pub mod resources;
pub mod state;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, Result};
use crate::fs::FileSystem;
use crate::types::SystemKind;

pub use dependency::TaskDependency;
pub use registry::{PrerequisiteState, TaskRegistry};
pub use resources::Resources;
pub use state::TaskState;

pub type TaskId = String;

/// Error annotation recorded when a task is force-killed.
pub const KILLED_ANNOTATION: &str = "Killed!";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFlags {
    /// A failure of this task does not abort the pipeline.
    pub can_fail: bool,
    /// Zero-length outputs pass validation.
    pub allow_empty_output: bool,
    /// Nobody waits for this task; it is handed off once running.
    pub detached: bool,
}

/// Well-known per-task files used by the exit-file protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFiles {
    pub program: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub exit_code: PathBuf,
}

impl TaskFiles {
    pub fn in_dir(dir: &Path, id: &str) -> Self {
        Self {
            program: dir.join(format!("{id}.sh")),
            stdout: dir.join(format!("{id}.stdout")),
            stderr: dir.join(format!("{id}.stderr")),
            exit_code: dir.join(format!("{id}.exitCode")),
        }
    }
}

/// Why a task never got (or stopped being) scheduled normally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchFailure {
    Spawn(String),
    PidProtocol(String),
    /// A prerequisite id is not in the registry.
    Unresolvable(TaskId),
    /// A prerequisite finished unsuccessfully.
    Blocked(TaskId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Shell text to run.
    pub command: String,
    pub dependency: TaskDependency,
    pub resources: Resources,
    pub system: SystemKind,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
    pub flags: TaskFlags,

    state: TaskState,
    backend_id: Option<String>,
    exit_code: Option<i32>,
    files: TaskFiles,
    errors: Vec<String>,
    launch_failure: Option<LaunchFailure>,
    timed_out: bool,
    /// Cached output validation result; empty string means "all good".
    output_check: Option<String>,
    started_at: Option<SystemTime>,
    finished_at: Option<SystemTime>,
    /// Finished without running because its outputs were current.
    #[serde(default)]
    up_to_date: bool,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, command: impl Into<String>, work_dir: &Path) -> Self {
        let id = id.into();
        let files = TaskFiles::in_dir(work_dir, &id);
        Self {
            id,
            command: command.into(),
            dependency: TaskDependency::default(),
            resources: Resources::default(),
            system: SystemKind::default(),
            timeout: None,
            stdin: None,
            flags: TaskFlags::default(),
            state: TaskState::New,
            backend_id: None,
            exit_code: None,
            files,
            errors: Vec::new(),
            launch_failure: None,
            timed_out: false,
            output_check: None,
            started_at: None,
            finished_at: None,
            up_to_date: false,
        }
    }

    pub fn with_system(mut self, system: SystemKind) -> Self {
        self.system = system;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_stdin(mut self, stdin: Option<String>) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_dependency(mut self, dependency: TaskDependency) -> Self {
        self.dependency = dependency;
        self
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn backend_id(&self) -> Option<&str> {
        self.backend_id.as_deref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn files(&self) -> &TaskFiles {
        &self.files
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    /// Wall-clock run time, once the task has both started and finished.
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.finished_at?;
        end.duration_since(start).ok()
    }

    /// Move to `next`, enforcing the lifecycle rules.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::ContractViolation(format!(
                "task '{}' cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        match next {
            TaskState::Running => self.started_at = Some(SystemTime::now()),
            s if s.is_terminal() => self.finished_at = Some(SystemTime::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Record the backend identifier (PID, job id, instance id).
    pub fn set_backend_id(&mut self, id: impl Into<String>) -> Result<()> {
        if self.is_done() {
            return Err(PipelineError::ContractViolation(format!(
                "task '{}' is {} and can no longer change its backend id",
                self.id, self.state
            )));
        }
        self.backend_id = Some(id.into());
        Ok(())
    }

    /// Transition to a terminal state and record the exit code in one step.
    pub fn finish(&mut self, state: TaskState, exit_code: Option<i32>) -> Result<()> {
        if !state.is_terminal() {
            return Err(PipelineError::ContractViolation(format!(
                "task '{}' cannot finish in non-terminal state {}",
                self.id, state
            )));
        }
        self.transition(state)?;
        self.exit_code = exit_code;
        Ok(())
    }

    /// Record a declaration whose outputs are current without running it,
    /// so later references to it resolve as a finished prerequisite.
    pub fn mark_up_to_date(&mut self) -> Result<()> {
        self.transition(TaskState::Queued)?;
        self.transition(TaskState::Running)?;
        self.finish(TaskState::FinishedOk, Some(0))?;
        self.up_to_date = true;
        Ok(())
    }

    /// Fail a task that could not be launched.
    pub fn fail_launch(&mut self, failure: LaunchFailure) -> Result<()> {
        let text = match &failure {
            LaunchFailure::Spawn(reason) => format!("Spawn failed: {reason}"),
            LaunchFailure::PidProtocol(reason) => format!("PID protocol error: {reason}"),
            LaunchFailure::Unresolvable(dep) => format!("Unknown prerequisite task '{dep}'"),
            LaunchFailure::Blocked(dep) => format!("Prerequisite task '{dep}' failed"),
        };
        self.finish(TaskState::FinishedError, None)?;
        self.launch_failure = Some(failure);
        self.errors.push(text);
        Ok(())
    }

    pub fn mark_timed_out(&mut self) {
        if !self.is_done() {
            self.timed_out = true;
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Lazily validate declared outputs after a successful run.
    ///
    /// Returns the error text, or `None` when every output is fine (or the
    /// task has not finished OK). The result is computed once and cached.
    pub fn check_outputs(&mut self, fs: &dyn FileSystem) -> Option<&str> {
        if self.output_check.is_none() {
            if self.state != TaskState::FinishedOk {
                return None;
            }
            let text = self
                .dependency
                .output_errors(fs, self.flags.allow_empty_output);
            if !text.is_empty() {
                tracing::warn!(task = %self.id, "{}", text);
            }
            self.output_check = Some(text);
        }
        self.output_check.as_deref().filter(|s| !s.is_empty())
    }

    /// The error this task should surface to the pipeline, if any.
    pub fn failure(&mut self, fs: &dyn FileSystem) -> Option<PipelineError> {
        let task = self.id.clone();
        match self.state {
            TaskState::FinishedOk => {
                self.check_outputs(fs)
                    .map(|reason| PipelineError::OutputValidation {
                        task,
                        reason: reason.to_string(),
                    })
            }
            TaskState::FinishedError | TaskState::FinishedKilled => {
                let err = match &self.launch_failure {
                    Some(LaunchFailure::Spawn(reason)) => PipelineError::Spawn {
                        task,
                        reason: reason.clone(),
                    },
                    Some(LaunchFailure::PidProtocol(reason)) => PipelineError::PidProtocol {
                        task,
                        reason: reason.clone(),
                    },
                    Some(LaunchFailure::Unresolvable(missing)) => {
                        PipelineError::DependencyUnresolvable {
                            task,
                            missing: missing.clone(),
                        }
                    }
                    Some(LaunchFailure::Blocked(prerequisite)) => {
                        PipelineError::PrerequisiteFailed {
                            task,
                            prerequisite: prerequisite.clone(),
                        }
                    }
                    None if self.timed_out => PipelineError::TaskTimeout {
                        task,
                        timeout: self.timeout.unwrap_or_default(),
                    },
                    None if self.state == TaskState::FinishedKilled => {
                        PipelineError::TaskKilled { task }
                    }
                    None => PipelineError::TaskFailed {
                        task,
                        exit_code: self.exit_code.unwrap_or(-1),
                    },
                };
                Some(err)
            }
            _ => None,
        }
    }

    /// Last `lines` lines of the captured STDERR file; empty when the file
    /// is missing or unreadable.
    pub fn stderr_tail(&self, fs: &dyn FileSystem, lines: usize) -> String {
        let Ok(text) = fs.read_to_string(&self.files.stderr) else {
            return String::new();
        };
        let all: Vec<&str> = text.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    /// Forget run-time state so a recovered task can be scheduled again.
    pub(crate) fn reset_for_resubmit(&mut self) {
        self.state = TaskState::New;
        self.backend_id = None;
        self.exit_code = None;
        self.launch_failure = None;
        self.timed_out = false;
        self.output_check = None;
        self.started_at = None;
        self.finished_at = None;
        self.up_to_date = false;
    }
}
