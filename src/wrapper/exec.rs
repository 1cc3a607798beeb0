// src/wrapper/exec.rs

//! `pipeworks exec TIMEOUT STDOUT STDERR EXIT_FILE CMD [ARGS..]`
//!
//! Prints its own PID, runs the command while copying its output both to
//! this process's streams and to the given files, and finally writes the
//! exit status text to the exit file. A file name of `-` disables that
//! file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::ExecArgs;
use crate::errors::Result;

use super::{supervise, Outcome};

/// How long output copiers may run after the child is gone.
const TEE_GRACE: Duration = Duration::from_secs(5);

fn target(name: &str) -> Option<PathBuf> {
    (name != "-").then(|| PathBuf::from(name))
}

/// Run the wrapper; returns this process's exit status.
pub async fn exec_wrapper(args: &ExecArgs) -> Result<i32> {
    {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", std::process::id())?;
        out.flush()?;
    }

    let exit_file = target(&args.exit_file);
    let timeout = (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs));

    let mut child = match Command::new(&args.command)
        .args(&args.args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let outcome = Outcome::Failed(format!("{}: {e}", args.command));
            warn!(command = %args.command, error = %e, "cannot start command");
            write_exit_file(exit_file.as_deref(), &outcome).await?;
            return Ok(outcome.wrapper_status());
        }
    };
    info!(command = %args.command, pid = ?child.id(), "command started");

    let mut copiers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let file = open_target(target(&args.stdout).as_deref()).await?;
        copiers.push(tokio::spawn(tee(stdout, tokio::io::stdout(), file)));
    }
    if let Some(stderr) = child.stderr.take() {
        let file = open_target(target(&args.stderr).as_deref()).await?;
        copiers.push(tokio::spawn(tee(stderr, tokio::io::stderr(), file)));
    }

    let outcome = supervise(&mut child, timeout).await;
    for copier in copiers {
        if tokio::time::timeout(TEE_GRACE, copier).await.is_err() {
            debug!("output copier still busy; giving up on it");
        }
    }

    info!(exit = %outcome.exit_text(), "command finished");
    write_exit_file(exit_file.as_deref(), &outcome).await?;
    Ok(outcome.wrapper_status())
}

async fn open_target(path: Option<&Path>) -> Result<Option<tokio::fs::File>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    Ok(Some(file))
}

/// Copy `reader` to `console` and, if given, `file`. Console errors (the
/// parent went away) do not stop the file copy.
async fn tee<R, W>(mut reader: R, mut console: W, mut file: Option<tokio::fs::File>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut console_ok = true;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "read failed");
                break;
            }
        };
        if console_ok {
            console_ok = console.write_all(&buf[..n]).await.is_ok()
                && console.flush().await.is_ok();
        }
        if let Some(f) = file.as_mut() {
            if let Err(e) = f.write_all(&buf[..n]).await {
                warn!(error = %e, "cannot write capture file");
                file = None;
            }
        }
    }
    if let Some(f) = file.as_mut() {
        let _ = f.flush().await;
    }
}

/// Write via a temporary file and rename, so readers never see a partial
/// exit file.
async fn write_exit_file(path: Option<&Path>, outcome: &Outcome) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, outcome.exit_text())
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn args(dir: &Path, timeout: u64, command: &str, rest: &[&str]) -> ExecArgs {
        ExecArgs {
            timeout_secs: timeout,
            stdout: dir.join("t.stdout").to_string_lossy().into_owned(),
            stderr: dir.join("t.stderr").to_string_lossy().into_owned(),
            exit_file: dir.join("t.exitCode").to_string_lossy().into_owned(),
            command: command.to_string(),
            args: rest.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let status = exec_wrapper(&args(dir.path(), 0, "sh", &["-c", "echo hi; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(status, 1);
        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("t.stdout"), "hi\n");
        assert_eq!(read("t.stderr"), "oops\n");
        assert_eq!(read("t.exitCode"), "3");
    }

    #[tokio::test]
    async fn timeout_is_written_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let status = exec_wrapper(&args(dir.path(), 1, "sleep", &["30"])).await.unwrap();
        assert_eq!(status, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("t.exitCode")).unwrap(),
            "Time out"
        );
    }

    #[tokio::test]
    async fn missing_program_reports_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let status = exec_wrapper(&args(dir.path(), 0, "/no/such/program", &[]))
            .await
            .unwrap();
        assert_eq!(status, 1);
        let text = std::fs::read_to_string(dir.path().join("t.exitCode")).unwrap();
        assert!(text.starts_with("/no/such/program"), "{text}");
    }
}
