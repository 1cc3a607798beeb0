// src/task/registry.rs

//! Shared task table.
//!
//! Every task lives here for the whole run (tasks are never removed, only
//! finished). Besides the id -> task map the registry keeps a reverse index
//! from declared output path to the tasks producing it, which staleness
//! evaluation uses to spot inputs that are about to be rewritten.
//!
//! All mutations go through the registry and bump a version counter carried
//! by a `tokio::sync::watch` channel, so waiters can suspend until something
//! changes instead of polling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::debug;

use crate::errors::{PipelineError, Result};

use super::{Task, TaskId, TaskState};

/// Readiness of a task's prerequisite tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrerequisiteState {
    /// Every prerequisite finished successfully.
    Ready,
    /// At least one prerequisite is still live.
    Waiting,
    /// A prerequisite finished unsuccessfully.
    Failed(TaskId),
    /// A prerequisite id is not registered.
    Unresolvable(TaskId),
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
    by_output: HashMap<PathBuf, Vec<TaskId>>,
}

impl Inner {
    fn index(&mut self, task: &Task) {
        for out in &task.dependency.outputs {
            let producers = self.by_output.entry(out.clone()).or_default();
            if !producers.contains(&task.id) {
                producers.push(task.id.clone());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRegistry {
    inner: Arc<Mutex<Inner>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            version: Arc::new(tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Register a new task. Ids must be unique.
    pub fn add(&self, task: Task) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.tasks.contains_key(&task.id) {
                return Err(PipelineError::ContractViolation(format!(
                    "task '{}' is already registered",
                    task.id
                )));
            }
            inner.index(&task);
            inner.order.push(task.id.clone());
            inner.tasks.insert(task.id.clone(), task);
        }
        self.bump();
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().tasks.contains_key(id)
    }

    /// Snapshot of one task.
    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().tasks.get(id).cloned()
    }

    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.lock().tasks.get(id).map(Task::state)
    }

    /// Mutate a task in place under the registry lock.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Result<R> {
        let out = self.update_silently(id, f)?;
        self.bump();
        Ok(out)
    }

    /// Like [`update`](Self::update), but waiters are not woken.
    ///
    /// Only for bookkeeping nobody waits on, such as the memoised output
    /// check. A waiter that uses this inside its own wait loop would
    /// otherwise wake itself forever.
    pub fn update_silently<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Result<R> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| PipelineError::TaskNotFound(id.to_string()))?;
        Ok(f(task))
    }

    /// Move a task to a terminal state.
    ///
    /// Returns `false` (and changes nothing) when the task was already
    /// terminal, so replayed completions are harmless.
    pub fn mark_finished(&self, id: &str, state: TaskState, exit_code: Option<i32>) -> Result<bool> {
        let changed = self.update(id, |task| {
            if task.is_done() {
                return Ok(false);
            }
            task.finish(state, exit_code).map(|_| true)
        })??;
        if changed {
            debug!(task = %id, %state, ?exit_code, "task finished");
        }
        Ok(changed)
    }

    /// Tasks declaring `path` as an output, with their current state.
    pub fn producers_of(&self, path: &Path) -> Vec<(TaskId, TaskState)> {
        let inner = self.lock();
        inner
            .by_output
            .get(path)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.tasks.get(id).map(|t| (id.clone(), t.state())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First producer of `path` that has not reached a terminal state.
    pub fn pending_producer(&self, path: &Path) -> Option<TaskId> {
        self.producers_of(path)
            .into_iter()
            .find(|(_, state)| !state.is_terminal())
            .map(|(id, _)| id)
    }

    pub fn is_done(&self, id: &str) -> Result<bool> {
        self.state(id)
            .map(TaskState::is_terminal)
            .ok_or_else(|| PipelineError::TaskNotFound(id.to_string()))
    }

    pub fn prerequisites_state(&self, id: &str) -> Result<PrerequisiteState> {
        let inner = self.lock();
        let task = inner
            .tasks
            .get(id)
            .ok_or_else(|| PipelineError::TaskNotFound(id.to_string()))?;

        let mut waiting = false;
        for dep in &task.dependency.tasks {
            match inner.tasks.get(dep).map(Task::state) {
                None => return Ok(PrerequisiteState::Unresolvable(dep.clone())),
                Some(s) if s.is_terminal() && !s.is_success() => {
                    return Ok(PrerequisiteState::Failed(dep.clone()));
                }
                Some(s) if !s.is_terminal() => waiting = true,
                Some(_) => {}
            }
        }
        Ok(if waiting {
            PrerequisiteState::Waiting
        } else {
            PrerequisiteState::Ready
        })
    }

    /// Receiver that changes whenever any task is added or mutated.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Suspend until `id` reaches a terminal state.
    pub async fn wait_terminal(&self, id: &str) -> Result<TaskState> {
        let mut rx = self.version.subscribe();
        loop {
            // Subscribing before the check means no change can be missed.
            match self.state(id) {
                Some(state) if state.is_terminal() => return Ok(state),
                Some(_) => {}
                None => return Err(PipelineError::TaskNotFound(id.to_string())),
            }
            if rx.changed().await.is_err() {
                return Err(PipelineError::ContractViolation(
                    "task registry dropped while waiting".to_string(),
                ));
            }
        }
    }

    /// Suspend until every registered task is terminal.
    pub async fn wait_all_terminal(&self) {
        let mut rx = self.version.subscribe();
        loop {
            if self.pending().is_empty() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Ids of tasks not yet terminal, in registration order.
    pub fn pending(&self) -> Vec<TaskId> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter(|id| inner.tasks.get(*id).is_some_and(|t| !t.is_done()))
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every task in registration order.
    pub fn snapshot(&self) -> Vec<Task> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect()
    }

    /// Repopulate from a snapshot. Existing tasks with the same id are
    /// replaced.
    pub fn restore(&self, tasks: Vec<Task>) {
        {
            let mut inner = self.lock();
            for task in tasks {
                inner.index(&task);
                if !inner.tasks.contains_key(&task.id) {
                    inner.order.push(task.id.clone());
                }
                inner.tasks.insert(task.id.clone(), task);
            }
        }
        self.bump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task(id: &str) -> Task {
        Task::new(id, "true", Path::new("."))
    }

    fn run(registry: &TaskRegistry, id: &str) {
        registry
            .update(id, |t| {
                t.transition(TaskState::Queued)?;
                t.transition(TaskState::Running)
            })
            .unwrap()
            .unwrap();
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let registry = TaskRegistry::new();
        registry.add(task("a")).unwrap();
        assert!(registry.add(task("a")).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn mark_finished_is_idempotent() {
        let registry = TaskRegistry::new();
        registry.add(task("a")).unwrap();
        run(&registry, "a");

        assert!(registry.mark_finished("a", TaskState::FinishedOk, Some(0)).unwrap());
        assert!(!registry.mark_finished("a", TaskState::FinishedError, Some(1)).unwrap());
        let a = registry.get("a").unwrap();
        assert_eq!(a.state(), TaskState::FinishedOk);
        assert_eq!(a.exit_code(), Some(0));
    }

    #[test]
    fn prerequisites_report_failures_and_unknown_ids() {
        let registry = TaskRegistry::new();
        registry.add(task("a")).unwrap();
        let mut b = task("b");
        b.dependency.add_task("a");
        registry.add(b).unwrap();
        let mut c = task("c");
        c.dependency.add_task("ghost");
        registry.add(c).unwrap();

        assert_eq!(registry.prerequisites_state("b").unwrap(), PrerequisiteState::Waiting);
        assert_eq!(
            registry.prerequisites_state("c").unwrap(),
            PrerequisiteState::Unresolvable("ghost".into())
        );

        run(&registry, "a");
        registry.mark_finished("a", TaskState::FinishedError, Some(2)).unwrap();
        assert_eq!(
            registry.prerequisites_state("b").unwrap(),
            PrerequisiteState::Failed("a".into())
        );
    }

    #[test]
    fn reverse_index_tracks_producers() {
        let registry = TaskRegistry::new();
        let mut a = task("a");
        a.dependency.outputs.push(PathBuf::from("x.txt"));
        registry.add(a).unwrap();

        assert_eq!(registry.pending_producer(Path::new("x.txt")), Some("a".into()));
        assert_eq!(registry.pending_producer(Path::new("y.txt")), None);
    }

    #[test]
    fn silent_updates_do_not_notify() {
        let registry = TaskRegistry::new();
        registry.add(task("a")).unwrap();
        let mut rx = registry.subscribe();
        rx.borrow_and_update();

        registry.update_silently("a", |t| t.add_error("noted")).unwrap();
        assert!(!rx.has_changed().unwrap());

        registry.update("a", |t| t.add_error("again")).unwrap();
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn wait_terminal_wakes_on_finish() {
        let registry = TaskRegistry::new();
        registry.add(task("a")).unwrap();
        run(&registry, "a");

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_terminal("a").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.mark_finished("a", TaskState::FinishedOk, Some(0)).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(state, TaskState::FinishedOk);
    }
}
