// src/checkpoint/recovery.rs

//! Reconcile a loaded checkpoint with a fresh registry.
//!
//! - Tasks whose work completed (`FINISHED_OK`, `DETACHED_HANDED_OFF`) are
//!   restored as-is and never run again.
//! - Tasks running under a known backend id are re-attached, not resubmitted.
//! - Everything else (not started, queued, failed, killed, or running without
//!   an id) is reset and scheduled again.

use tracing::info;

use crate::task::{Task, TaskId, TaskRegistry, TaskState};
use crate::types::SystemKind;

use super::{Checkpoint, InterpreterState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reattach {
    pub task_id: TaskId,
    pub system: SystemKind,
    pub backend_id: String,
}

#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub interpreter: InterpreterState,
    tasks: Vec<Task>,
    pub finished: Vec<TaskId>,
    pub reattach: Vec<Reattach>,
    pub resubmit: Vec<TaskId>,
}

impl RecoveryPlan {
    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        let mut finished = Vec::new();
        let mut reattach = Vec::new();
        let mut resubmit = Vec::new();
        let mut tasks = Vec::with_capacity(checkpoint.tasks.len());

        for mut task in checkpoint.tasks {
            match (task.state(), checkpoint.in_flight.get(&task.id)) {
                (state, _) if state.is_success() => finished.push(task.id.clone()),
                (TaskState::Running, Some(flight)) => reattach.push(Reattach {
                    task_id: task.id.clone(),
                    system: flight.system,
                    backend_id: flight.backend_id.clone(),
                }),
                _ => {
                    task.reset_for_resubmit();
                    resubmit.push(task.id.clone());
                }
            }
            tasks.push(task);
        }

        info!(
            finished = finished.len(),
            reattach = reattach.len(),
            resubmit = resubmit.len(),
            "recovery plan ready"
        );

        Self {
            interpreter: checkpoint.interpreter,
            tasks,
            finished,
            reattach,
            resubmit,
        }
    }

    /// Load every task into `registry`.
    pub fn restore_into(&self, registry: &TaskRegistry) {
        registry.restore(self.tasks.clone());
    }
}
