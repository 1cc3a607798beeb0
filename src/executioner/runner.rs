// src/executioner/runner.rs

//! The executioner's background loop.
//!
//! One loop per executioner owns the pending queue, the in-flight `Cmd`
//! handles and the slot counter. It wakes on requests and on a fixed poll
//! interval; each tick it dispatches ready tasks, polls the completion
//! monitor, checks spawned processes and sweeps timeouts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cmd::{run_kill_command, Cmd, CmdSpec};
use crate::config::RuntimeSettings;
use crate::errors::{PipelineError, Result};
use crate::fs::FileSystem;
use crate::monitor::Monitor;
use crate::task::registry::PrerequisiteState;
use crate::task::{LaunchFailure, Task, TaskId, TaskRegistry, TaskState, KILLED_ANNOTATION};

use super::backend::Backend;

/// Lines of STDERR logged when a task ends abnormally.
const POSTMORTEM_LINES: usize = 20;

#[derive(Debug)]
pub(crate) enum Request {
    Submit(TaskId),
    Reattach {
        id: TaskId,
        backend_id: String,
    },
    Kill {
        id: TaskId,
        done: oneshot::Sender<()>,
    },
    Shutdown {
        drain: bool,
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Requested,
    Timeout,
    Stalled,
    Shutdown,
}

#[derive(Debug)]
struct RunningTask {
    /// `None` once a submit/provision command has returned, or for
    /// re-attached tasks.
    cmd: Option<Cmd>,
    slots: usize,
    started: Instant,
    timeout: Option<Duration>,
    backend_id: Option<String>,
    /// When a task-tracking process was first seen dead.
    exited_at: Option<Instant>,
}

pub(crate) struct ExecutionerLoop<B: Backend> {
    backend: Arc<B>,
    registry: TaskRegistry,
    fs: Arc<dyn FileSystem>,
    settings: RuntimeSettings,
    monitor: Monitor,
    queue: VecDeque<TaskId>,
    running: HashMap<TaskId, RunningTask>,
    used_slots: usize,
    /// `Some(drain)` once shutdown has begun.
    shutdown: Option<bool>,
}

impl<B: Backend> ExecutionerLoop<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        registry: TaskRegistry,
        fs: Arc<dyn FileSystem>,
        settings: RuntimeSettings,
        monitor: Monitor,
    ) -> Self {
        Self {
            backend,
            registry,
            fs,
            settings,
            monitor,
            queue: VecDeque::new(),
            running: HashMap::new(),
            used_slots: 0,
            shutdown: None,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        let system = self.backend.system();
        info!(%system, capacity = self.backend.capacity(), "executioner loop started");

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut channel_open = true;
        let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();

        loop {
            tokio::select! {
                request = rx.recv(), if channel_open => match request {
                    Some(request) => self.handle_request(request, &mut waiters).await,
                    None => {
                        debug!(%system, "request channel closed");
                        channel_open = false;
                        self.begin_shutdown(!self.settings.kill_on_shutdown).await;
                    }
                },
                _ = ticker.tick() => self.tick().await,
            }

            if self.shutdown.is_some() && self.queue.is_empty() && self.running.is_empty() {
                break;
            }
        }

        if let Err(e) = self.backend.shutdown().await {
            warn!(%system, error = %e, "backend shutdown failed");
        }
        for waiter in waiters {
            let _ = waiter.send(());
        }
        info!(%system, "executioner loop finished");
    }

    async fn handle_request(&mut self, request: Request, waiters: &mut Vec<oneshot::Sender<()>>) {
        match request {
            Request::Submit(id) => {
                if self.shutdown.is_some() {
                    warn!(task = %id, "submitted after shutdown; killing");
                    self.kill(&id, KillReason::Shutdown).await;
                } else {
                    debug!(task = %id, "task queued");
                    self.queue.push_back(id);
                    self.dispatch().await;
                }
            }
            Request::Reattach { id, backend_id } => self.reattach(id, backend_id),
            Request::Kill { id, done } => {
                self.kill(&id, KillReason::Requested).await;
                let _ = done.send(());
            }
            Request::Shutdown { drain, done } => {
                waiters.push(done);
                self.begin_shutdown(drain).await;
            }
        }
    }

    async fn tick(&mut self) {
        self.dispatch().await;
        self.poll_monitor().await;
        self.check_processes().await;
        self.sweep_timeouts().await;
    }

    async fn begin_shutdown(&mut self, drain: bool) {
        if self.shutdown == Some(false) {
            return;
        }
        self.shutdown = Some(drain);
        info!(
            system = %self.backend.system(),
            drain,
            queued = self.queue.len(),
            running = self.running.len(),
            "executioner shutting down"
        );
        if !drain {
            let ids: Vec<TaskId> = self
                .queue
                .iter()
                .cloned()
                .chain(self.running.keys().cloned())
                .collect();
            for id in ids {
                self.kill(&id, KillReason::Shutdown).await;
            }
        }
    }

    /// Launch every queued task whose prerequisites are done and that fits
    /// into the free slots. Queue order is kept for tasks left behind.
    async fn dispatch(&mut self) {
        let mut left = VecDeque::with_capacity(self.queue.len());
        while let Some(id) = self.queue.pop_front() {
            let prerequisites = match self.registry.prerequisites_state(&id) {
                Ok(state) => state,
                Err(e) => {
                    warn!(task = %id, error = %e, "dropping queued task");
                    continue;
                }
            };
            match prerequisites {
                PrerequisiteState::Waiting => left.push_back(id),
                PrerequisiteState::Failed(dep) => {
                    self.fail_launch(&id, LaunchFailure::Blocked(dep))
                }
                PrerequisiteState::Unresolvable(dep) => {
                    self.fail_launch(&id, LaunchFailure::Unresolvable(dep))
                }
                PrerequisiteState::Ready => {
                    let Some(task) = self.registry.get(&id) else {
                        continue;
                    };
                    if task.is_done() {
                        continue;
                    }
                    let slots = self.backend.slots_for(&task);
                    if self.used_slots.saturating_add(slots) > self.backend.capacity() {
                        left.push_back(id);
                        continue;
                    }
                    self.launch(task, slots).await;
                }
            }
        }
        self.queue = left;
    }

    async fn start(&self, task: &Task) -> Result<Cmd> {
        self.backend.prepare(task, self.fs.as_ref()).await?;
        let argv = self.backend.build_run_argv(task)?;
        let mut spec = CmdSpec::new(task.id.clone(), argv);
        spec.pid_parser = Some(self.backend.pid_parser());
        if self.backend.cmd_tracks_task() {
            spec.stdin = task.stdin.clone();
        }
        spec.own_process_group = self.backend.own_process_group();
        spec.kill_on_drop = !task.flags.detached;
        Cmd::spawn(spec).await
    }

    async fn launch(&mut self, task: Task, slots: usize) {
        let id = task.id.clone();
        let mut cmd = match self.start(&task).await {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(task = %id, error = %e, "failed to launch task");
                let failure = match e {
                    PipelineError::PidProtocol { reason, .. } => LaunchFailure::PidProtocol(reason),
                    PipelineError::Spawn { reason, .. } => LaunchFailure::Spawn(reason),
                    other => LaunchFailure::Spawn(other.to_string()),
                };
                self.fail_launch(&id, failure);
                return;
            }
        };

        let backend_id = cmd.backend_id().map(str::to_string);
        let detached = task.flags.detached;
        let started = self.registry.update(&id, |t| -> Result<()> {
            if let Some(b) = &backend_id {
                t.set_backend_id(b.clone())?;
            }
            t.transition(TaskState::Running)?;
            if detached {
                t.transition(TaskState::DetachedHandedOff)?;
            }
            Ok(())
        });
        if let Err(e) = started.and_then(|r| r) {
            error!(task = %id, error = %e, "task changed state during launch; killing it");
            let kill_argv = backend_id.as_deref().map(|b| self.backend.build_kill_argv(b));
            cmd.kill(kill_argv.as_deref()).await;
            return;
        }

        info!(
            task = %id,
            backend_id = backend_id.as_deref().unwrap_or("-"),
            system = %self.backend.system(),
            "task running"
        );

        if detached {
            info!(task = %id, "detached task handed off");
            return;
        }

        self.used_slots += slots;
        self.running.insert(
            id,
            RunningTask {
                cmd: Some(cmd),
                slots,
                started: Instant::now(),
                timeout: task.timeout,
                backend_id,
                exited_at: None,
            },
        );
    }

    fn reattach(&mut self, id: TaskId, backend_id: String) {
        let Some(task) = self.registry.get(&id) else {
            warn!(task = %id, "cannot re-attach unknown task");
            return;
        };
        if task.is_done() || self.running.contains_key(&id) {
            return;
        }
        let slots = self.backend.slots_for(&task);
        self.used_slots = self.used_slots.saturating_add(slots);
        info!(task = %id, backend_id = %backend_id, "re-attached to running task");
        self.running.insert(
            id,
            RunningTask {
                cmd: None,
                slots,
                started: Instant::now(),
                timeout: task.timeout,
                backend_id: Some(backend_id),
                exited_at: None,
            },
        );
    }

    fn fail_launch(&self, id: &str, failure: LaunchFailure) {
        let result = self.registry.update(id, |t| {
            if t.is_done() {
                return Ok(());
            }
            t.fail_launch(failure)
        });
        if let Err(e) = result.and_then(|r| r) {
            warn!(task = %id, error = %e, "cannot record launch failure");
        }
    }

    async fn poll_monitor(&mut self) {
        if self.running.is_empty() {
            return;
        }
        let watched: Vec<TaskId> = self.running.keys().cloned().collect();
        let outcome = match self
            .monitor
            .poll(&watched, &self.registry, self.fs.as_ref())
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(system = %self.backend.system(), error = %e, "monitor poll failed");
                return;
            }
        };
        for id in outcome.finished {
            self.complete(&id).await;
        }
        for id in outcome.stalled {
            self.kill(&id, KillReason::Stalled).await;
        }
    }

    /// Release a task that reached a terminal state.
    async fn complete(&mut self, id: &str) {
        let Some(mut entry) = self.running.remove(id) else {
            return;
        };
        self.used_slots = self.used_slots.saturating_sub(entry.slots);

        let alive = entry
            .cmd
            .as_mut()
            .map(|cmd| matches!(cmd.try_wait(), Ok(None)));
        if let Some(mut cmd) = entry.cmd.take() {
            tokio::spawn(async move {
                let _ = cmd.wait().await;
            });
        }

        let Some(task) = self.registry.get(id) else {
            return;
        };
        info!(
            task = %id,
            state = %task.state(),
            exit_code = ?task.exit_code(),
            "task finished"
        );
        if !task.state().is_success() {
            self.postmortem(&task, alive);
        }
        if let Err(e) = self.backend.after_finish(&task).await {
            warn!(task = %id, error = %e, "post-finish hook failed");
        }
    }

    fn postmortem(&self, task: &Task, alive: Option<bool>) {
        warn!(
            task = %task.id,
            state = %task.state(),
            exit_code = ?task.exit_code(),
            backend_id = task.backend_id().unwrap_or("-"),
            process_alive = ?alive,
            "task ended abnormally"
        );
        let tail = task.stderr_tail(self.fs.as_ref(), POSTMORTEM_LINES);
        if !tail.is_empty() {
            warn!(task = %task.id, "last lines of stderr:\n{}", tail);
        }
    }

    /// Watch the spawned processes themselves.
    ///
    /// A task-tracking wrapper that died without leaving an exit file within
    /// the grace period failed. A submit/provision command that exited
    /// non-zero failed to launch its task; one that exited zero is done and
    /// the monitor takes over.
    async fn check_processes(&mut self) {
        let tracks = self.backend.cmd_tracks_task();
        let grace = self.settings.exit_file_grace;
        let mut lost = Vec::new();
        let mut rejected = Vec::new();

        for (id, entry) in self.running.iter_mut() {
            let Some(cmd) = entry.cmd.as_mut() else {
                continue;
            };
            let code = match cmd.try_wait() {
                Ok(Some(code)) => code,
                Ok(None) => continue,
                Err(e) => {
                    warn!(task = %id, error = %e, "cannot poll process");
                    continue;
                }
            };
            if tracks {
                let exited = *entry.exited_at.get_or_insert_with(Instant::now);
                if exited.elapsed() >= grace {
                    lost.push((id.clone(), code, cmd.stderr_tail()));
                }
            } else if code == 0 {
                debug!(task = %id, "submission command finished");
                entry.cmd = None;
            } else {
                rejected.push((id.clone(), code, cmd.stderr_tail()));
            }
        }

        for (id, code, stderr) in lost {
            let Some(task) = self.registry.get(&id) else {
                continue;
            };
            if self.fs.exists(&task.files().exit_code) {
                // Landed after this tick's monitor poll.
                continue;
            }
            error!(task = %id, exit_code = code, "process exited without writing an exit file");
            let result = self.registry.update(&id, |t| {
                t.add_error(format!(
                    "Process exited with code {code} without writing exit file"
                ));
                if !stderr.is_empty() {
                    t.add_error(stderr);
                }
                t.finish(TaskState::FinishedError, Some(code))
            });
            if let Err(e) = result.and_then(|r| r) {
                warn!(task = %id, error = %e, "cannot finish lost task");
            }
            self.complete(&id).await;
        }

        for (id, code, stderr) in rejected {
            error!(task = %id, exit_code = code, "submission command failed");
            let reason = if stderr.is_empty() {
                format!("submission exited with code {code}")
            } else {
                format!("submission exited with code {code}: {stderr}")
            };
            self.fail_launch(&id, LaunchFailure::Spawn(reason));
            self.complete(&id).await;
        }
    }

    async fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<TaskId> = self
            .running
            .iter()
            .filter(|(_, e)| {
                e.timeout
                    .is_some_and(|t| now.saturating_duration_since(e.started) > t)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            warn!(task = %id, "task exceeded its timeout");
            self.kill(&id, KillReason::Timeout).await;
        }
    }

    /// Best-effort kill. A terminal task is left alone.
    async fn kill(&mut self, id: &str, reason: KillReason) {
        self.queue.retain(|queued| queued != id);

        let Some(task) = self.registry.get(id) else {
            debug!(task = %id, "kill of unknown task ignored");
            return;
        };
        if task.is_done() {
            debug!(task = %id, state = %task.state(), "kill of finished task ignored");
            self.complete(id).await;
            return;
        }

        info!(task = %id, ?reason, "killing task");
        if let Some(mut entry) = self.running.remove(id) {
            self.used_slots = self.used_slots.saturating_sub(entry.slots);
            let kill_argv = entry
                .backend_id
                .as_deref()
                .map(|b| self.backend.build_kill_argv(b));
            match entry.cmd.take() {
                Some(mut cmd) => {
                    cmd.kill(kill_argv.as_deref()).await;
                    tokio::spawn(async move {
                        let _ = cmd.wait().await;
                    });
                }
                None => {
                    if let Some(argv) = &kill_argv {
                        if let Err(e) = run_kill_command(argv).await {
                            warn!(task = %id, error = %e, "kill command failed");
                        }
                    }
                }
            }
        }
        self.monitor.forget(id);

        let result = self.registry.update(id, |t| {
            if t.is_done() {
                return Ok(());
            }
            if reason == KillReason::Timeout {
                t.mark_timed_out();
            }
            if reason == KillReason::Stalled {
                t.add_error("No heartbeat received");
            }
            t.add_error(KILLED_ANNOTATION);
            t.finish(TaskState::FinishedKilled, None)
        });
        if let Err(e) = result.and_then(|r| r) {
            warn!(task = %id, error = %e, "cannot record kill");
        }

        if let Some(task) = self.registry.get(id) {
            self.postmortem(&task, None);
            if let Err(e) = self.backend.after_finish(&task).await {
                warn!(task = %id, error = %e, "post-finish hook failed");
            }
        }
    }
}
