// src/checkpoint/mod.rs

//! Checkpoint artifact.
//!
//! A checkpoint is a JSON envelope `{version, checksum, payload}` where
//! `payload` is the serialized [`Checkpoint`] and `checksum` is its blake3
//! hash. Loading verifies both before anything is restored.

pub mod recovery;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{PipelineError, Result};
use crate::fs::FileSystem;
use crate::task::{Task, TaskId, TaskRegistry, TaskState};
use crate::types::SystemKind;

pub use recovery::RecoveryPlan;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Where the declaration walker was when the checkpoint was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterState {
    pub pipeline_file: Option<PathBuf>,
    /// Index of the first `[[task]]` declaration not yet processed.
    pub next_declaration: usize,
}

/// Backend handle of a task that was running when the checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub system: SystemKind,
    pub backend_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub reason: String,
    pub interpreter: InterpreterState,
    pub tasks: Vec<Task>,
    pub in_flight: BTreeMap<TaskId, InFlight>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    checksum: String,
    payload: String,
}

fn checkpoint_error(msg: impl Into<String>) -> PipelineError {
    PipelineError::Checkpoint(msg.into())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Checkpoint {
    /// Snapshot the whole registry.
    pub fn capture(
        registry: &TaskRegistry,
        interpreter: InterpreterState,
        reason: impl Into<String>,
    ) -> Self {
        let tasks = registry.snapshot();
        let in_flight = tasks
            .iter()
            .filter(|t| t.state() == TaskState::Running)
            .filter_map(|t| {
                t.backend_id().map(|id| {
                    (
                        t.id.clone(),
                        InFlight {
                            system: t.system,
                            backend_id: id.to_string(),
                        },
                    )
                })
            })
            .collect();
        Self {
            version: CHECKPOINT_VERSION,
            created_at: now_secs(),
            reason: reason.into(),
            interpreter,
            tasks,
            in_flight,
        }
    }

    /// Checkpoint holding one task, shipped to a cloud instance.
    pub fn for_task(task: &Task) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            created_at: now_secs(),
            reason: format!("remote execution of task '{}'", task.id),
            interpreter: InterpreterState::default(),
            tasks: vec![task.clone()],
            in_flight: BTreeMap::new(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        let payload = serde_json::to_string(self)
            .map_err(|e| checkpoint_error(format!("cannot serialize checkpoint: {e}")))?;
        let envelope = CheckpointFile {
            version: self.version,
            checksum: blake3::hash(payload.as_bytes()).to_hex().to_string(),
            payload,
        };
        let body = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| checkpoint_error(format!("cannot serialize checkpoint: {e}")))?;
        // The previous checkpoint stays intact until the new one is complete.
        let tmp = temp_path(path);
        fs.write(&tmp, &body).map_err(|e| {
            checkpoint_error(format!("cannot write checkpoint '{}': {e}", tmp.display()))
        })?;
        fs.rename(&tmp, path).map_err(|e| {
            checkpoint_error(format!("cannot publish checkpoint '{}': {e}", path.display()))
        })?;
        info!(path = %path.display(), tasks = self.tasks.len(), "checkpoint saved");
        Ok(())
    }

    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let text = fs.read_to_string(path).map_err(|e| {
            checkpoint_error(format!("cannot read checkpoint '{}': {e}", path.display()))
        })?;
        let envelope: CheckpointFile = serde_json::from_str(&text).map_err(|e| {
            checkpoint_error(format!("'{}' is not a checkpoint: {e}", path.display()))
        })?;
        if envelope.version != CHECKPOINT_VERSION {
            return Err(checkpoint_error(format!(
                "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                envelope.version
            )));
        }
        let checksum = blake3::hash(envelope.payload.as_bytes()).to_hex().to_string();
        if checksum != envelope.checksum {
            return Err(checkpoint_error(format!(
                "checksum mismatch in '{}'",
                path.display()
            )));
        }
        let checkpoint: Checkpoint = serde_json::from_str(&envelope.payload)
            .map_err(|e| checkpoint_error(format!("corrupt checkpoint payload: {e}")))?;
        info!(
            path = %path.display(),
            tasks = checkpoint.tasks.len(),
            reason = %checkpoint.reason,
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
