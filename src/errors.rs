// src/errors.rs

//! Crate-wide error type and helpers.
//!
//! The task-scoped variants (`Spawn`, `PidProtocol`, `OutputValidation`,
//! `TaskTimeout`, `TaskFailed`) carry the id of the task that hit them so the
//! pipeline driver can print the failing task's command and stderr tail.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to spawn task '{task}': {reason}")]
    Spawn { task: String, reason: String },

    #[error("PID protocol error for task '{task}': {reason}")]
    PidProtocol { task: String, reason: String },

    #[error("Output validation failed for task '{task}': {reason}")]
    OutputValidation { task: String, reason: String },

    #[error("Task '{task}' depends on unknown task '{missing}'")]
    DependencyUnresolvable { task: String, missing: String },

    #[error("Task '{task}' was not run because prerequisite '{prerequisite}' failed")]
    PrerequisiteFailed { task: String, prerequisite: String },

    #[error("Task '{task}' exceeded its timeout of {timeout:?}")]
    TaskTimeout { task: String, timeout: Duration },

    #[error("Task '{task}' failed with exit code {exit_code}")]
    TaskFailed { task: String, exit_code: i32 },

    #[error("Task '{task}' was killed")]
    TaskKilled { task: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cycle detected in task dependencies: {0}")]
    DagCycle(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Executioner for '{0}' is no longer running")]
    ExecutionerStopped(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Id of the task this error belongs to, if it is task-scoped.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            PipelineError::Spawn { task, .. }
            | PipelineError::PidProtocol { task, .. }
            | PipelineError::OutputValidation { task, .. }
            | PipelineError::DependencyUnresolvable { task, .. }
            | PipelineError::PrerequisiteFailed { task, .. }
            | PipelineError::TaskTimeout { task, .. }
            | PipelineError::TaskFailed { task, .. }
            | PipelineError::TaskKilled { task } => Some(task),
            _ => None,
        }
    }

    /// Whether this error aborts the whole pipeline.
    ///
    /// Task-scoped failures are recoverable when the task was declared with
    /// `can_fail`; everything else (configuration, checkpoint, IO) is fatal.
    pub fn is_fatal_for_pipeline(&self, can_fail: bool) -> bool {
        match self {
            PipelineError::Spawn { .. }
            | PipelineError::PidProtocol { .. }
            | PipelineError::OutputValidation { .. }
            | PipelineError::DependencyUnresolvable { .. }
            | PipelineError::TaskTimeout { .. }
            | PipelineError::TaskFailed { .. }
            | PipelineError::TaskKilled { .. } => !can_fail,
            // The failed prerequisite already decided whether to abort.
            PipelineError::PrerequisiteFailed { .. } => false,
            _ => true,
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PipelineError>;
