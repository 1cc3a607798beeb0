// src/executioner/backend.rs

//! Backend capability interface.
//!
//! Backends differ only in how they launch a task (argv / transport), which
//! completion monitor they rely on, and how a kill is translated. Everything
//! else (queueing, slots, timeouts, kill bookkeeping) lives in the shared
//! executioner loop. Program-file creation and argument templating are plain
//! helper functions the backends compose.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use crate::cmd::PidParser;
use crate::errors::Result;
use crate::fs::FileSystem;
use crate::monitor::MessageQueue;
use crate::task::Task;
use crate::types::{MonitorKind, SystemKind};

/// Boxed future returned by backend hooks.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Capacity of backends whose scheduler does its own admission control.
pub const UNBOUNDED_CAPACITY: usize = usize::MAX;

pub trait Backend: Send + Sync + 'static {
    fn system(&self) -> SystemKind;

    fn monitor_kind(&self) -> MonitorKind;

    /// Slots available to concurrently running tasks.
    fn capacity(&self) -> usize;

    /// Slots a task occupies while running. Clamped so an oversized request
    /// can still run alone.
    fn slots_for(&self, task: &Task) -> usize {
        task.resources.cpus().clamp(1, self.capacity().max(1))
    }

    /// Parser for the identifier line of the spawned command.
    fn pid_parser(&self) -> Arc<dyn PidParser>;

    /// Whether the spawned process lives exactly as long as the task
    /// (local wrapper) rather than returning after submission.
    fn cmd_tracks_task(&self) -> bool;

    /// Start the process in its own process group.
    fn own_process_group(&self) -> bool {
        false
    }

    /// Write program files, upload checkpoints, ... before spawning.
    fn prepare<'a>(&'a self, task: &'a Task, fs: &'a dyn FileSystem) -> BackendFuture<'a, ()>;

    fn build_run_argv(&self, task: &Task) -> Result<Vec<String>>;

    /// Argument vector that terminates the task identified by `backend_id`.
    fn build_kill_argv(&self, backend_id: &str) -> Vec<String>;

    /// Channel drained by a queue monitor.
    fn message_queue(&self) -> Option<Arc<dyn MessageQueue>> {
        None
    }

    /// Called once a task handled by this backend is terminal.
    fn after_finish<'a>(&'a self, _task: &'a Task) -> BackendFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Called once when the executioner loop exits.
    fn shutdown(&self) -> BackendFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Write `{work_dir}/{id}.sh` holding the task's shell text.
pub fn write_program_file(fs: &dyn FileSystem, task: &Task) -> Result<()> {
    let mut body = String::new();
    if !task.command.starts_with("#!") {
        body.push_str("#!/bin/sh\n");
    }
    body.push_str(&task.command);
    if !body.ends_with('\n') {
        body.push('\n');
    }
    fs.write(&task.files().program, body.as_bytes())?;
    Ok(())
}

/// Remove capture files left behind by an earlier run of the same task, so
/// a stale exit file cannot complete the new run.
pub fn clear_previous_run(fs: &dyn FileSystem, task: &Task) -> Result<()> {
    let files = task.files();
    for path in [&files.exit_code, &files.stdout, &files.stderr] {
        if fs.is_file(path) {
            fs.remove_file(path)?;
        }
    }
    Ok(())
}

pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Substitute `{name}` placeholders in one argument.
///
/// Returns `None` when the argument references a placeholder whose value is
/// absent, so optional flags like `--subnet-id={subnet_id}` simply vanish.
pub fn fill_template(arg: &str, values: &[(&str, Option<String>)]) -> Option<String> {
    let mut out = arg.to_string();
    for (name, value) in values {
        let placeholder = format!("{{{name}}}");
        if out.contains(&placeholder) {
            let value = value.as_deref()?;
            out = out.replace(&placeholder, value);
        }
    }
    Some(out)
}

/// Apply [`fill_template`] to every argument of a template.
pub fn fill_argv(template: &[String], values: &[(&str, Option<String>)]) -> Vec<String> {
    template
        .iter()
        .filter_map(|arg| fill_template(arg, values))
        .collect()
}

/// Whether any argument of `template` mentions `{name}`.
pub fn mentions(template: &[String], name: &str) -> bool {
    let placeholder = format!("{{{name}}}");
    template.iter().any(|a| a.contains(&placeholder))
}
