// src/monitor/channel.rs

//! Message channels used by cloud tasks to report back.
//!
//! [`MemoryQueue`] lives in-process (tests, fake providers). [`SpoolQueue`]
//! is a directory with one file per message, so any shared storage both the
//! instance and the pipeline host can reach works as a transport.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tracing::{debug, warn};

use crate::errors::Result;

/// Ordered, at-least-once message channel.
pub trait MessageQueue: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn send(&self, body: &str) -> Result<()>;

    /// Remove and return up to `max` messages, oldest first.
    fn receive(&self, max: usize) -> Result<Vec<String>>;

    /// Tear the channel down.
    fn delete(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MemoryQueue {
    name: String,
    messages: Arc<Mutex<VecDeque<String>>>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, body: &str) -> Result<()> {
        self.lock().push_back(body.to_string());
        Ok(())
    }

    fn receive(&self, max: usize) -> Result<Vec<String>> {
        let mut messages = self.lock();
        let n = max.min(messages.len());
        Ok(messages.drain(..n).collect())
    }

    fn delete(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
}

/// Directory-backed queue.
///
/// Each message is written to a temporary file and renamed into place, so a
/// reader never sees a partial message. File names sort by send time, then
/// sender PID, then a per-process sequence number.
#[derive(Debug)]
pub struct SpoolQueue {
    name: String,
    dir: PathBuf,
    seq: AtomicU64,
}

const MESSAGE_EXT: &str = "msg";

impl SpoolQueue {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("creating queue dir {:?}", dir))?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        Ok(Self {
            name,
            dir,
            seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MessageQueue for SpoolQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, body: &str) -> Result<()> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let stem = format!("{:024}-{:010}-{:08}", nanos, std::process::id(), seq);
        let tmp = self.dir.join(format!(".{stem}.tmp"));
        let dst = self.dir.join(format!("{stem}.{MESSAGE_EXT}"));
        fs::write(&tmp, body).with_context(|| format!("writing message {:?}", tmp))?;
        fs::rename(&tmp, &dst).with_context(|| format!("publishing message {:?}", dst))?;
        Ok(())
    }

    fn receive(&self, max: usize) -> Result<Vec<String>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("reading queue dir {:?}", self.dir))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == MESSAGE_EXT))
            .collect();
        files.sort();

        // A message leaves the spool only once it is about to be returned.
        // On a failure the batch is cut short and the rest stays on disk.
        let mut out = Vec::new();
        for path in files.into_iter().take(max) {
            let taken = fs::read_to_string(&path)
                .with_context(|| format!("reading message {:?}", path))
                .and_then(|body| {
                    fs::remove_file(&path)
                        .with_context(|| format!("removing message {:?}", path))?;
                    Ok(body)
                });
            match taken {
                Ok(body) => out.push(body),
                Err(e) if out.is_empty() => return Err(e.into()),
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "stopping batch early");
                    break;
                }
            }
        }
        if !out.is_empty() {
            debug!(queue = %self.name, count = out.len(), "received messages");
        }
        Ok(out)
    }

    fn delete(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("removing queue dir {:?}", self.dir))?;
        }
        Ok(())
    }
}
