// src/task/state.rs

//! Task lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// ```text
/// New -> Queued -> Running -> FinishedOk | FinishedError | FinishedKilled
///                          -> DetachedHandedOff
/// ```
///
/// Any non-terminal state may also jump straight to `FinishedKilled` (kill)
/// or `FinishedError` (spawn / PID protocol failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Queued,
    Running,
    FinishedOk,
    FinishedError,
    FinishedKilled,
    DetachedHandedOff,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::FinishedOk
                | TaskState::FinishedError
                | TaskState::FinishedKilled
                | TaskState::DetachedHandedOff
        )
    }

    /// Whether the task finished without error.
    ///
    /// A detached task counts as successful once handed off: nobody waits on it.
    pub fn is_success(self) -> bool {
        matches!(self, TaskState::FinishedOk | TaskState::DetachedHandedOff)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (New, Queued) => true,
            (Queued, Running) => true,
            (Running, FinishedOk | DetachedHandedOff) => true,
            (New | Queued | Running, FinishedError | FinishedKilled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::New => "NEW",
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::FinishedOk => "FINISHED_OK",
            TaskState::FinishedError => "FINISHED_ERROR",
            TaskState::FinishedKilled => "FINISHED_KILLED",
            TaskState::DetachedHandedOff => "DETACHED_HANDED_OFF",
        };
        f.write_str(s)
    }
}
