// src/wrapper/mod.rs

//! Process-side helpers behind the `exec`, `kill` and `task-exec`
//! subcommands.
//!
//! They run *inside* a task's process tree (locally, on a cluster node or on
//! a cloud instance) and speak the protocols the executioners expect: a PID
//! line, exit files, or messages on the queue.

pub mod exec;
pub mod task_exec;

use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

use crate::cmd::run_kill_command;
use crate::errors::Result;
use crate::monitor::{EXIT_SIGNAL, EXIT_TIMEOUT};

pub use exec::exec_wrapper;
pub use task_exec::task_exec;

/// Wrapper exit status for a task that exited non-zero or failed to start.
pub const EXIT_ERROR: i32 = 1;
/// Wrapper exit status for a task that hit its time limit.
pub const EXIT_TIMED_OUT: i32 = 2;

/// How a supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Exited(i32),
    TimedOut,
    Signaled,
    Failed(String),
}

impl Outcome {
    /// Text written to the exit file or sent as the exit message.
    pub fn exit_text(&self) -> String {
        match self {
            Outcome::Exited(code) => code.to_string(),
            Outcome::TimedOut => EXIT_TIMEOUT.to_string(),
            Outcome::Signaled => EXIT_SIGNAL.to_string(),
            Outcome::Failed(reason) => reason.clone(),
        }
    }

    /// Exit status of the wrapper itself.
    pub fn wrapper_status(&self) -> i32 {
        match self {
            Outcome::Exited(0) => 0,
            Outcome::TimedOut => EXIT_TIMED_OUT,
            _ => EXIT_ERROR,
        }
    }
}

/// Wait for `child`, killing it when `timeout` expires or when this process
/// receives SIGTERM / Ctrl-C.
pub async fn supervise(child: &mut Child, timeout: Option<Duration>) -> Outcome {
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => match status.code() {
                Some(code) => Outcome::Exited(code),
                None => Outcome::Signaled,
            },
            Err(e) => Outcome::Failed(e.to_string()),
        },
        _ = deadline => Outcome::TimedOut,
        _ = termination() => Outcome::Signaled,
    };

    if matches!(outcome, Outcome::TimedOut | Outcome::Signaled) {
        debug!(?outcome, "stopping child");
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "child already gone");
        }
        let _ = child.wait().await;
    }
    outcome
}

#[cfg(unix)]
async fn termination() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {},
                _ = ctrl_c() => {},
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination() {
    ctrl_c().await;
}

pub(crate) async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Send SIGTERM to each process group in `pids`. Every group is tried; the
/// first failure is returned.
pub async fn kill_pids(pids: &[i32]) -> Result<()> {
    let mut first_error = None;
    for pid in pids {
        let argv = vec![
            "kill".to_string(),
            "-TERM".to_string(),
            "--".to_string(),
            format!("-{pid}"),
        ];
        if let Err(e) = run_kill_command(&argv).await {
            warn!(pid, error = %e, "kill failed");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
