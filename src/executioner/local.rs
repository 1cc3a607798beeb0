// src/executioner/local.rs

//! Local processes.
//!
//! Each task runs under a small wrapper that prints its own PID, runs the
//! program file with redirected output and writes the exit file last. The
//! wrapper leads its own process group, so killing `-PID` takes the whole
//! task tree down.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crate::cmd::{PidParser, TrimPidParser};
use crate::config::LocalSection;
use crate::errors::Result;
use crate::fs::FileSystem;
use crate::task::Task;
use crate::types::{LauncherKind, MonitorKind, SystemKind};

use super::backend::{clear_previous_run, path_arg, write_program_file, Backend, BackendFuture};

/// Shell wrapper run as `sh -c WRAPPER pipeworks-task PROGRAM OUT ERR EXIT`.
///
/// The exit code goes to a temporary file first and is renamed into place,
/// so the monitor never reads a half-written exit file.
const SHELL_WRAPPER: &str =
    r#"echo $$; sh "$1" >"$2" 2>"$3"; echo $? >"$4.tmp"; mv "$4.tmp" "$4""#;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    cpus: usize,
    launcher: LauncherKind,
    exe: PathBuf,
}

impl LocalBackend {
    pub fn new(section: &LocalSection) -> Self {
        let cpus = section
            .cpus
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, usize::from));
        let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("pipeworks"));
        Self {
            cpus: cpus.max(1),
            launcher: section.launcher,
            exe,
        }
    }

    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus.max(1);
        self
    }

    pub fn with_launcher(mut self, launcher: LauncherKind) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn cpus(&self) -> usize {
        self.cpus
    }
}

impl Backend for LocalBackend {
    fn system(&self) -> SystemKind {
        SystemKind::Local
    }

    fn monitor_kind(&self) -> MonitorKind {
        MonitorKind::ExitFile
    }

    fn capacity(&self) -> usize {
        self.cpus
    }

    fn pid_parser(&self) -> Arc<dyn PidParser> {
        Arc::new(TrimPidParser)
    }

    fn cmd_tracks_task(&self) -> bool {
        true
    }

    fn own_process_group(&self) -> bool {
        true
    }

    fn prepare<'a>(&'a self, task: &'a Task, fs: &'a dyn FileSystem) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            write_program_file(fs, task)?;
            clear_previous_run(fs, task)
        })
    }

    fn build_run_argv(&self, task: &Task) -> Result<Vec<String>> {
        let files = task.files();
        let argv = match self.launcher {
            LauncherKind::Shell => vec![
                "sh".to_string(),
                "-c".to_string(),
                SHELL_WRAPPER.to_string(),
                "pipeworks-task".to_string(),
                path_arg(&files.program),
                path_arg(&files.stdout),
                path_arg(&files.stderr),
                path_arg(&files.exit_code),
            ],
            LauncherKind::Exec => vec![
                path_arg(&self.exe),
                "exec".to_string(),
                task.timeout.map_or(0, |t| t.as_secs().max(1)).to_string(),
                path_arg(&files.stdout),
                path_arg(&files.stderr),
                path_arg(&files.exit_code),
                "sh".to_string(),
                path_arg(&files.program),
            ],
        };
        Ok(argv)
    }

    fn build_kill_argv(&self, backend_id: &str) -> Vec<String> {
        vec![
            "kill".to_string(),
            "-TERM".to_string(),
            "--".to_string(),
            format!("-{backend_id}"),
        ]
    }
}
