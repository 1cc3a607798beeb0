// src/executioner/mod.rs

//! Executioners: turn queued tasks into running processes, jobs or
//! instances.
//!
//! - [`backend`] is the capability trait plus shared argv/program-file
//!   helpers.
//! - [`local`], [`cluster`] and [`cloud`] are the concrete backends.
//! - [`runner`] is the background loop shared by all of them.
//!
//! An [`Executioner`] is a cheap handle: requests go over a bounded channel
//! to the loop, which exclusively owns the in-flight `Cmd` handles.

pub mod backend;
pub mod cloud;
pub mod cluster;
pub mod local;
mod runner;

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::RuntimeSettings;
use crate::errors::{PipelineError, Result};
use crate::fs::FileSystem;
use crate::monitor::{ExitFileMonitor, Monitor, QueueMonitor};
use crate::task::{Task, TaskRegistry, TaskState};
use crate::types::{MonitorKind, SystemKind};

pub use backend::{Backend, BackendFuture};
pub use cloud::{CloudBackend, CloudProvider, CloudResources, CommandCloudProvider, ProvisionRequest};
pub use cluster::ClusterBackend;
pub use local::LocalBackend;

use runner::{ExecutionerLoop, Request};

#[derive(Debug)]
pub struct Executioner {
    system: SystemKind,
    registry: TaskRegistry,
    tx: mpsc::Sender<Request>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Executioner {
    /// Start the background loop for `backend`. Must run inside a Tokio
    /// runtime.
    pub fn spawn<B: Backend>(
        backend: B,
        registry: TaskRegistry,
        fs: Arc<dyn FileSystem>,
        settings: RuntimeSettings,
    ) -> Result<Self> {
        let system = backend.system();
        let monitor = match backend.monitor_kind() {
            MonitorKind::ExitFile => Monitor::ExitFile(ExitFileMonitor::new()),
            MonitorKind::Queue => {
                let queue = backend.message_queue().ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "{system} backend polls a message queue but provides none"
                    ))
                })?;
                Monitor::Queue(QueueMonitor::new(queue, settings.heartbeat_timeout))
            }
        };

        let (tx, rx) = mpsc::channel(settings.queue_length.max(1));
        let event_loop =
            ExecutionerLoop::new(Arc::new(backend), registry.clone(), fs, settings, monitor);
        let handle = tokio::spawn(event_loop.run(rx));

        Ok(Self {
            system,
            registry,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn system(&self) -> SystemKind {
        self.system
    }

    fn stopped(&self) -> PipelineError {
        PipelineError::ExecutionerStopped(self.system.to_string())
    }

    /// Queue a registered task. Returns as soon as the request is accepted.
    pub async fn submit(&self, id: &str) -> Result<()> {
        let system = self.system;
        self.registry.update(id, |t| {
            if t.system != system {
                return Err(PipelineError::ContractViolation(format!(
                    "task '{}' runs on {} but was submitted to the {system} executioner",
                    t.id, t.system
                )));
            }
            t.transition(TaskState::Queued)
        })??;

        if self.tx.send(Request::Submit(id.to_string())).await.is_err() {
            self.registry.update(id, |t| {
                t.add_error("Executioner stopped before the task could run");
                t.finish(TaskState::FinishedKilled, None)
            })??;
            return Err(self.stopped());
        }
        debug!(task = %id, system = %system, "task submitted");
        Ok(())
    }

    /// Track a task that is already running under `backend_id`.
    pub async fn reattach(&self, id: &str, backend_id: &str) -> Result<()> {
        self.tx
            .send(Request::Reattach {
                id: id.to_string(),
                backend_id: backend_id.to_string(),
            })
            .await
            .map_err(|_| self.stopped())
    }

    /// Best-effort kill. Killing a finished (or unknown) task is a no-op.
    pub async fn kill(&self, id: &str) -> Result<()> {
        match self.registry.state(id) {
            None => return Ok(()),
            Some(state) if state.is_terminal() => return Ok(()),
            Some(_) => {}
        }
        let (done, wait) = oneshot::channel();
        if self
            .tx
            .send(Request::Kill {
                id: id.to_string(),
                done,
            })
            .await
            .is_err()
        {
            debug!(task = %id, "executioner already stopped; nothing to kill");
            return Ok(());
        }
        let _ = wait.await;
        Ok(())
    }

    /// Snapshot of a task handled by this executioner.
    pub fn find_task(&self, id: &str) -> Option<Task> {
        self.registry.get(id).filter(|t| t.system == self.system)
    }

    /// Whether every task assigned to this executioner is terminal.
    pub fn tasks_done(&self) -> bool {
        self.registry
            .snapshot()
            .iter()
            .filter(|t| t.system == self.system)
            .all(Task::is_done)
    }

    /// Stop the loop. With `drain`, in-flight and queued tasks run to
    /// completion first; otherwise they are killed.
    pub async fn shutdown(&self, drain: bool) -> Result<()> {
        info!(system = %self.system, drain, "stopping executioner");
        let (done, wait) = oneshot::channel();
        if self.tx.send(Request::Shutdown { drain, done }).await.is_ok() {
            let _ = wait.await;
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| anyhow::anyhow!("executioner loop panicked: {e}"))?;
        }
        Ok(())
    }
}
