#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use pipeworks::config::PipelineFile;
use pipeworks::fs::RealFileSystem;
use pipeworks::pipeline::Context;
use pipeworks::task::{Task, TaskRegistry, TaskState};

pub use pipeworks_test_utils::{init_tracing, with_timeout};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Context over the real filesystem.
pub fn real_context(config: PipelineFile) -> Context {
    Context::new(config, Arc::new(RealFileSystem))
}

/// Register `task` and drive it through `Queued -> Running -> state`.
pub fn add_finished(registry: &TaskRegistry, task: Task, state: TaskState, exit: Option<i32>) {
    let id = task.id.clone();
    registry.add(task).unwrap();
    registry
        .update(&id, |t| {
            t.transition(TaskState::Queued)?;
            t.transition(TaskState::Running)?;
            t.finish(state, exit)
        })
        .unwrap()
        .unwrap();
}

/// Register `task` as running.
pub fn add_running(registry: &TaskRegistry, task: Task) {
    let id = task.id.clone();
    registry.add(task).unwrap();
    registry
        .update(&id, |t| {
            t.transition(TaskState::Queued)?;
            t.transition(TaskState::Running)
        })
        .unwrap()
        .unwrap();
}

pub fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path.as_ref()).unwrap_or_default()
}
