// src/monitor/queue.rs

//! Message-channel polling for tasks that report asynchronously.
//!
//! Each poll drains the channel, appends output chunks to the task's local
//! capture files, writes the exit file when the exit message arrives and
//! finishes the task. Any message counts as a sign of life; a watched task
//! that stays silent longer than the heartbeat timeout is reported as
//! stalled so the executioner can kill it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::fs::FileSystem;
use crate::task::{TaskId, TaskRegistry};

use super::channel::MessageQueue;
use super::message::{Message, MessageKind};
use super::{finish_from_report, ExitReport, PollOutcome};

/// Messages pulled from the channel per receive call.
const RECEIVE_BATCH: usize = 10;

#[derive(Debug)]
pub struct QueueMonitor {
    queue: Arc<dyn MessageQueue>,
    heartbeat_timeout: Option<Duration>,
    last_seen: HashMap<TaskId, Instant>,
    finished: HashSet<TaskId>,
}

impl QueueMonitor {
    pub fn new(queue: Arc<dyn MessageQueue>, heartbeat_timeout: Option<Duration>) -> Self {
        Self {
            queue,
            heartbeat_timeout,
            last_seen: HashMap::new(),
            finished: HashSet::new(),
        }
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    pub fn poll(
        &mut self,
        watched: &[TaskId],
        registry: &TaskRegistry,
        fs: &dyn FileSystem,
    ) -> Result<PollOutcome> {
        let mut outcome = PollOutcome::default();
        let now = Instant::now();

        loop {
            let batch = self.queue.receive(RECEIVE_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for body in batch {
                match Message::decode(&body) {
                    Ok(message) => {
                        let (id, kind) = (message.task_id.clone(), message.kind);
                        // One bad message must not take the rest of the batch with it.
                        if let Err(e) = self.handle(message, now, registry, fs, &mut outcome) {
                            warn!(task = %id, %kind, error = %e, "cannot handle message");
                        }
                    }
                    Err(e) => warn!(queue = %self.queue.name(), error = %e, "dropping malformed message"),
                }
            }
        }

        if let Some(timeout) = self.heartbeat_timeout {
            for id in watched {
                if self.finished.contains(id) {
                    continue;
                }
                let last = *self.last_seen.entry(id.clone()).or_insert(now);
                let silent_for = now.saturating_duration_since(last);
                if silent_for > timeout {
                    warn!(task = %id, ?silent_for, "no heartbeat from task");
                    outcome.stalled.push(id.clone());
                    self.last_seen.insert(id.clone(), now);
                }
            }
        }

        Ok(outcome)
    }

    fn handle(
        &mut self,
        message: Message,
        now: Instant,
        registry: &TaskRegistry,
        fs: &dyn FileSystem,
        outcome: &mut PollOutcome,
    ) -> Result<()> {
        let id = message.task_id.clone();
        if self.finished.contains(&id) {
            debug!(task = %id, kind = %message.kind, "ignoring message for finished task");
            return Ok(());
        }
        let Some(task) = registry.get(&id) else {
            warn!(task = %id, "message for unknown task");
            return Ok(());
        };
        self.last_seen.insert(id.clone(), now);

        let files = task.files();
        match message.kind {
            MessageKind::Stdout => fs.append(&files.stdout, &message.payload)?,
            MessageKind::Stderr => fs.append(&files.stderr, &message.payload)?,
            MessageKind::Heartbeat => debug!(task = %id, "heartbeat"),
            MessageKind::Exit => {
                let text = message.payload_text();
                if let Err(e) = fs.write(&files.exit_code, text.as_bytes()) {
                    warn!(task = %id, error = %e, "cannot write exit file");
                }
                self.finished.insert(id.clone());
                self.last_seen.remove(&id);
                let report = ExitReport::parse(&text);
                info!(task = %id, exit = %text.trim(), "exit message received");
                if finish_from_report(registry, &id, &report)? {
                    outcome.finished.push(id);
                }
            }
        }
        Ok(())
    }

    /// Stop tracking a task (e.g. after it was killed).
    pub fn forget(&mut self, id: &str) {
        self.last_seen.remove(id);
        self.finished.insert(id.to_string());
    }
}
