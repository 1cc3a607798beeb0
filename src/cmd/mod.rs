// src/cmd/mod.rs

//! Process / job supervisor.
//!
//! A [`Cmd`] owns one spawned child: a local task wrapper, a cluster submit
//! command, or a cloud provisioning command. It
//! - optionally reads the backend identifier from the first STDOUT line,
//! - feeds STDIN in the background and closes it,
//! - drains STDOUT and STDERR with two independent reader tasks so neither
//!   pipe can fill up and stall the child,
//! - kills through a backend-specific command plus the local handle.

pub mod pid;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{PipelineError, Result};

pub use pid::{
    read_pid_line, PidLineError, PidParser, RegexPidParser, TabPidParser, TrimPidParser,
    MAX_PID_LINE_LENGTH,
};

/// Lines of STDOUT/STDERR kept in memory per child.
const TAIL_LINES: usize = 200;

/// How long to wait for the STDERR reader after a premature EOF on STDOUT.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to spawn one child.
#[derive(Debug, Clone)]
pub struct CmdSpec {
    pub task_id: String,
    pub argv: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub stdin: Option<String>,
    /// Read the backend identifier from the first STDOUT line.
    pub pid_parser: Option<Arc<dyn PidParser>>,
    /// Put the child in its own process group so a group kill reaches the
    /// whole task tree.
    pub own_process_group: bool,
    /// Kill the child when the handle is dropped.
    pub kill_on_drop: bool,
}

impl CmdSpec {
    pub fn new(task_id: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            task_id: task_id.into(),
            argv,
            current_dir: None,
            stdin: None,
            pid_parser: None,
            own_process_group: false,
            kill_on_drop: true,
        }
    }
}

/// Bounded line buffer shared with a reader task.
#[derive(Debug, Clone, Default)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn text(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Handle to a running child.
#[derive(Debug)]
pub struct Cmd {
    task_id: String,
    child: Child,
    backend_id: Option<String>,
    stdout: OutputTail,
    stderr: OutputTail,
    readers: Vec<JoinHandle<()>>,
    killed: bool,
}

impl Cmd {
    /// Spawn the child described by `spec`.
    ///
    /// When a PID parser is configured this suspends until the first line
    /// arrives, and fails with [`PipelineError::PidProtocol`] if the line is
    /// missing, too long or unparsable. The child is killed in that case.
    pub async fn spawn(spec: CmdSpec) -> Result<Cmd> {
        let (program, args) = spec.argv.split_first().ok_or_else(|| PipelineError::Spawn {
            task: spec.task_id.clone(),
            reason: "empty argument vector".to_string(),
        })?;

        info!(task = %spec.task_id, argv = ?spec.argv, "spawning process");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(spec.kill_on_drop);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        set_process_group(&mut command, spec.own_process_group);

        let mut child = command.spawn().map_err(|e| PipelineError::Spawn {
            task: spec.task_id.clone(),
            reason: format!("{}: {}", program, e),
        })?;

        let stdout_tail = OutputTail::default();
        let stderr_tail = OutputTail::default();
        let mut readers = Vec::new();

        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(
                spec.task_id.clone(),
                "stderr",
                BufReader::new(stderr),
                stderr_tail.clone(),
            ));
        }

        if let (Some(text), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            let task_id = spec.task_id.clone();
            tokio::spawn(async move {
                if let Err(e) = feed_stdin(&mut stdin, text.as_bytes()).await {
                    warn!(task = %task_id, error = %e, "failed to write stdin");
                }
            });
        }

        let mut stdout = match child.stdout.take() {
            Some(out) => BufReader::new(out),
            None => {
                return Err(PipelineError::Spawn {
                    task: spec.task_id,
                    reason: "child has no stdout pipe".to_string(),
                })
            }
        };

        let mut backend_id = None;
        if let Some(parser) = &spec.pid_parser {
            match read_backend_id(&mut stdout, parser.as_ref()).await {
                Ok(id) => {
                    debug!(task = %spec.task_id, backend_id = %id, "read backend identifier");
                    backend_id = Some(id);
                }
                Err(reason) => {
                    let _ = child.start_kill();
                    let stderr_text = drain_stderr(&mut readers, &stderr_tail).await;
                    let reason = if stderr_text.is_empty() {
                        reason
                    } else {
                        format!("{reason}: {stderr_text}")
                    };
                    return Err(PipelineError::PidProtocol {
                        task: spec.task_id,
                        reason,
                    });
                }
            }
        }

        readers.push(spawn_line_reader(
            spec.task_id.clone(),
            "stdout",
            stdout,
            stdout_tail.clone(),
        ));

        Ok(Cmd {
            task_id: spec.task_id,
            child,
            backend_id,
            stdout: stdout_tail,
            stderr: stderr_tail,
            readers,
            killed: false,
        })
    }

    pub fn backend_id(&self) -> Option<&str> {
        self.backend_id.as_deref()
    }

    /// OS process id of the direct child, while it is alive.
    pub fn os_pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn was_killed(&self) -> bool {
        self.killed
    }

    pub fn stdout_tail(&self) -> String {
        self.stdout.text()
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr.text()
    }

    /// Non-blocking exit check. Returns the exit code (`-1` for signals).
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        let status = self
            .child
            .try_wait()
            .with_context(|| format!("polling process of task '{}'", self.task_id))?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    /// Wait for the child and both reader tasks to finish.
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("waiting for process of task '{}'", self.task_id))?;
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
        Ok(status.code().unwrap_or(-1))
    }

    /// Best-effort kill.
    ///
    /// Runs the backend kill command (if any) synchronously, then asks the
    /// local handle to terminate regardless of the outcome. Never fails.
    pub async fn kill(&mut self, kill_argv: Option<&[String]>) {
        if let Some(argv) = kill_argv {
            if let Err(e) = run_kill_command(argv).await {
                warn!(task = %self.task_id, error = %e, "kill command failed");
            }
        }
        if let Err(e) = self.child.start_kill() {
            debug!(task = %self.task_id, error = %e, "local handle already gone");
        }
        self.killed = true;
    }
}

#[cfg(unix)]
fn set_process_group(command: &mut Command, own: bool) {
    if own {
        command.process_group(0);
    }
}

#[cfg(not(unix))]
fn set_process_group(_command: &mut Command, _own: bool) {}

/// Run a backend kill command; success is exit code 0.
pub async fn run_kill_command(argv: &[String]) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty kill command"))?;
    info!(argv = ?argv, "running kill command");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("running kill command '{}'", program))?;
    if !output.status.success() {
        return Err(anyhow!(
            "kill command {:?} exited with {}: {}",
            argv,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )
        .into());
    }
    Ok(())
}

/// Write `content` to a child's STDIN and close it.
pub async fn feed_stdin<W>(stdin: &mut W, content: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    stdin.write_all(content).await?;
    stdin.flush().await?;
    stdin.shutdown().await
}

async fn read_backend_id<R>(
    reader: &mut BufReader<R>,
    parser: &dyn PidParser,
) -> std::result::Result<String, String>
where
    R: AsyncRead + Unpin,
{
    match read_pid_line(reader).await {
        Ok(Some(line)) => parser
            .parse(&line)
            .ok_or_else(|| format!("cannot parse identifier from line '{line}'")),
        Ok(None) => Err("process closed stdout before printing an identifier".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

async fn drain_stderr(readers: &mut Vec<JoinHandle<()>>, tail: &OutputTail) -> String {
    for reader in readers.drain(..) {
        let _ = tokio::time::timeout(STDERR_DRAIN_GRACE, reader).await;
    }
    tail.text()
}

fn spawn_line_reader<R>(
    task_id: String,
    stream: &'static str,
    reader: BufReader<R>,
    tail: OutputTail,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(task = %task_id, stream, "{}", line);
                    tail.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(task = %task_id, stream, error = %e, "reader stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn reads_identifier_then_keeps_streaming() {
        let mut spec = CmdSpec::new("t", sh("echo 4242; echo out; echo err >&2"));
        spec.pid_parser = Some(Arc::new(TrimPidParser));
        let mut cmd = Cmd::spawn(spec).await.unwrap();

        assert_eq!(cmd.backend_id(), Some("4242"));
        assert_eq!(cmd.wait().await.unwrap(), 0);
        assert_eq!(cmd.stdout_tail(), "out");
        assert_eq!(cmd.stderr_tail(), "err");
    }

    #[tokio::test]
    async fn missing_identifier_surfaces_stderr() {
        let mut spec = CmdSpec::new("t", sh("echo 'no such queue' >&2; exit 3"));
        spec.pid_parser = Some(Arc::new(TrimPidParser));
        match Cmd::spawn(spec).await {
            Err(PipelineError::PidProtocol { reason, .. }) => {
                assert!(reason.contains("no such queue"), "{reason}")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdin_is_fed_and_closed() {
        let mut spec = CmdSpec::new("t", sh("cat"));
        spec.stdin = Some("line one\nline two\n".into());
        let mut cmd = Cmd::spawn(spec).await.unwrap();
        assert_eq!(cmd.wait().await.unwrap(), 0);
        assert_eq!(cmd.stdout_tail(), "line one\nline two");
    }

    #[tokio::test]
    async fn large_output_on_both_streams_does_not_deadlock() {
        let script = "i=0; while [ $i -lt 2000 ]; do \
                      echo \"out line $i\"; echo \"err line $i\" >&2; i=$((i+1)); done";
        let mut cmd = Cmd::spawn(CmdSpec::new("t", sh(script))).await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(20), cmd.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);
        assert!(cmd.stderr_tail().ends_with("err line 1999"));
    }

    #[tokio::test]
    async fn kill_terminates_even_if_kill_command_fails() {
        let mut cmd = Cmd::spawn(CmdSpec::new("t", sh("sleep 30"))).await.unwrap();
        let bogus = vec!["false".to_string()];
        cmd.kill(Some(&bogus)).await;
        let code = tokio::time::timeout(Duration::from_secs(5), cmd.wait())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(code, 0);
        assert!(cmd.was_killed());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let spec = CmdSpec::new("t", vec!["/definitely/not/here".into()]);
        assert!(matches!(
            Cmd::spawn(spec).await,
            Err(PipelineError::Spawn { .. })
        ));
    }
}
