// src/task/dependency.rs

//! Declared inputs, outputs and prerequisite tasks, plus the Make-style
//! staleness rule evaluated over them.
//!
//! A dependency is *stale* (the task must run) when:
//! - it declares neither inputs nor outputs,
//! - any output is missing, a zero-length file, or an empty directory,
//! - any input is missing, or is produced by a task that has not finished,
//! - or the oldest output is strictly older than the newest input.
//!
//! Equal timestamps count as up to date.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{PipelineError, Result};
use crate::fs::FileSystem;

use super::registry::TaskRegistry;
use super::TaskId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    /// Goal side.
    pub outputs: Vec<PathBuf>,
    /// Prerequisite files.
    pub inputs: Vec<PathBuf>,
    /// Prerequisite tasks that must be terminal before this one starts.
    pub tasks: Vec<TaskId>,
}

/// Outcome of scanning one side of the dependency.
enum Probe {
    /// Short-circuit: the task has to run.
    MustRun,
    /// Extreme modification time seen, `None` if the side is empty.
    Bound(Option<SystemTime>),
}

impl TaskDependency {
    /// Add an input. A registered task id becomes a prerequisite task.
    pub fn add_input(&mut self, input: &str, registry: &TaskRegistry) {
        if registry.contains(input) {
            self.add_task(input);
        } else {
            push_unique(&mut self.inputs, PathBuf::from(input));
        }
    }

    /// Add an output. Task ids are not allowed on the output side.
    pub fn add_output(&mut self, output: &str, registry: &TaskRegistry) -> Result<()> {
        if registry.contains(output) {
            return Err(PipelineError::ContractViolation(format!(
                "cannot have task as a dependency output, task id: '{output}'"
            )));
        }
        push_unique(&mut self.outputs, PathBuf::from(output));
        Ok(())
    }

    pub fn add_task(&mut self, id: &str) {
        if !self.tasks.iter().any(|t| t == id) {
            self.tasks.push(id.to_string());
        }
    }

    /// No declared inputs and no declared outputs.
    pub fn is_vacuous(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    /// Evaluate the staleness rule.
    ///
    /// Must not be called while holding the registry lock.
    pub fn is_stale(&self, fs: &dyn FileSystem, registry: &TaskRegistry) -> Result<bool> {
        if self.is_vacuous() {
            debug!("vacuous dependency, must run");
            return Ok(true);
        }

        let min_out = match self.min_output_time(fs, registry)? {
            Probe::MustRun => return Ok(true),
            Probe::Bound(t) => t,
        };
        let max_in = match self.max_input_time(fs, registry)? {
            Probe::MustRun => return Ok(true),
            Probe::Bound(t) => t,
        };

        // An empty side acts as +inf (outputs) or -inf (inputs).
        let stale = match (min_out, max_in) {
            (Some(out), Some(inp)) => out < inp,
            _ => false,
        };
        debug!(?min_out, ?max_in, stale, "compared modification times");
        Ok(stale)
    }

    fn min_output_time(&self, fs: &dyn FileSystem, registry: &TaskRegistry) -> Result<Probe> {
        let mut min: Option<SystemTime> = None;
        for out in &self.outputs {
            if registry.contains(&out.to_string_lossy()) {
                return Err(PipelineError::ContractViolation(format!(
                    "cannot have a task id on the output side of a dependency: '{}'",
                    out.display()
                )));
            }
            if !fs.exists(out) {
                debug!(output = %out.display(), "output does not exist");
                return Ok(Probe::MustRun);
            }
            if fs.is_dir(out) {
                if fs.read_dir(out)?.is_empty() {
                    debug!(output = %out.display(), "output is an empty directory");
                    return Ok(Probe::MustRun);
                }
            } else if fs.size(out)? == 0 {
                debug!(output = %out.display(), "output is empty");
                return Ok(Probe::MustRun);
            }
            let modified = fs.modified(out)?;
            min = Some(min.map_or(modified, |m| m.min(modified)));
        }
        Ok(Probe::Bound(min))
    }

    fn max_input_time(&self, fs: &dyn FileSystem, registry: &TaskRegistry) -> Result<Probe> {
        let mut max: Option<SystemTime> = None;
        for input in &self.inputs {
            if let Some(producer) = registry.pending_producer(input) {
                debug!(
                    input = %input.display(),
                    producer = %producer,
                    "input will be rewritten by an unfinished task"
                );
                return Ok(Probe::MustRun);
            }
            if !fs.exists(input) {
                debug!(input = %input.display(), "input does not exist");
                return Ok(Probe::MustRun);
            }
            let modified = fs.modified(input)?;
            max = Some(max.map_or(modified, |m| m.max(modified)));
        }
        Ok(Probe::Bound(max))
    }

    /// Validation text for declared outputs; empty when everything is fine.
    pub fn output_errors(&self, fs: &dyn FileSystem, allow_empty: bool) -> String {
        let mut errors = Vec::new();
        for out in &self.outputs {
            if !fs.exists(out) {
                errors.push(format!(
                    "Error: Output file '{}' does not exist.",
                    out.display()
                ));
            } else if !allow_empty && is_empty_output(fs, out) {
                errors.push(format!(
                    "Error: Output file '{}' has zero length.",
                    out.display()
                ));
            }
        }
        errors.join("\n")
    }
}

fn is_empty_output(fs: &dyn FileSystem, path: &Path) -> bool {
    if fs.is_dir(path) {
        fs.read_dir(path).map(|e| e.is_empty()).unwrap_or(true)
    } else {
        fs.size(path).map(|s| s == 0).unwrap_or(true)
    }
}

fn push_unique(list: &mut Vec<PathBuf>, path: PathBuf) {
    if !list.contains(&path) {
        list.push(path);
    }
}
