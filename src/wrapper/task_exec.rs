// src/wrapper/task_exec.rs

//! Instance side of a cloud task: restore the single-task checkpoint that was
//! uploaded at provisioning time, run its command and stream output,
//! heartbeats and the final exit status over the message channel.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::errors::{PipelineError, Result};
use crate::fs::RealFileSystem;
use crate::monitor::{MessageQueue, OutputReporter};

use super::{supervise, Outcome};

type SharedReporter = Arc<Mutex<OutputReporter<dyn MessageQueue>>>;

const READER_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Run the task stored in `checkpoint`, reporting to `queue`. Returns the
/// wrapper exit status.
pub async fn task_exec(
    checkpoint: &Path,
    queue: Arc<dyn MessageQueue>,
    heartbeat: Duration,
) -> Result<i32> {
    let checkpoint = Checkpoint::load(&RealFileSystem, checkpoint)?;
    let task = checkpoint
        .tasks
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Checkpoint("checkpoint holds no task".into()))?;
    info!(task = %task.id, queue = %queue.name(), "running restored task");

    let reporter: SharedReporter = Arc::new(Mutex::new(OutputReporter::new(task.id.clone(), queue)));

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&task.command)
        .stdin(if task.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let outcome = Outcome::Failed(format!("cannot start task: {e}"));
            with_reporter(&reporter, |r| r.exit(&outcome.exit_text()))?;
            return Ok(outcome.wrapper_status());
        }
    };

    if let (Some(text), Some(mut stdin)) = (task.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                debug!(error = %e, "stdin closed early");
            }
        });
    }

    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(forward(out, Stream::Stdout, reporter.clone())));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(forward(err, Stream::Stderr, reporter.clone())));
    }

    let beats = {
        let reporter = reporter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = with_reporter(&reporter, |r| r.heartbeat()) {
                    warn!(error = %e, "heartbeat failed");
                }
            }
        })
    };

    let outcome = supervise(&mut child, task.timeout).await;
    for reader in readers {
        if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
            debug!("output reader still busy; giving up on it");
        }
    }
    beats.abort();

    info!(task = %task.id, exit = %outcome.exit_text(), "task finished");
    with_reporter(&reporter, |r| r.exit(&outcome.exit_text()))?;
    Ok(outcome.wrapper_status())
}

fn with_reporter<T>(
    reporter: &SharedReporter,
    f: impl FnOnce(&mut OutputReporter<dyn MessageQueue>) -> Result<T>,
) -> Result<T> {
    let mut guard = reporter.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut guard)
}

async fn forward<R: AsyncRead + Unpin>(mut reader: R, stream: Stream, reporter: SharedReporter) {
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "read failed");
                break;
            }
        };
        let sent = with_reporter(&reporter, |r| match stream {
            Stream::Stdout => r.stdout(&buf[..n]),
            Stream::Stderr => r.stderr(&buf[..n]),
        });
        if let Err(e) = sent {
            warn!(error = %e, "cannot report output");
        }
    }
}
