// src/executioner/cluster.rs

//! Generic cluster scheduler.
//!
//! A task becomes a job script on shared storage. The configured submit
//! command (optionally run through a remote shell such as `ssh head-node`)
//! receives the script path and prints the job id on its first line. The
//! job script itself writes the exit file, so completion is detected by the
//! exit-file monitor just like local tasks.
//!
//! Submit templates may use `{cpus}`, `{mem}`, `{task_id}` and
//! `{timeout_secs}`; an argument whose placeholder has no value is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cmd::{PidParser, RegexPidParser};
use crate::config::ClusterSection;
use crate::errors::{PipelineError, Result};
use crate::fs::FileSystem;
use crate::task::Task;
use crate::types::{MonitorKind, SystemKind};

use super::backend::{
    clear_previous_run, fill_argv, path_arg, write_program_file, Backend, BackendFuture,
    UNBOUNDED_CAPACITY,
};

#[derive(Debug, Clone)]
pub struct ClusterBackend {
    section: ClusterSection,
    parser: Arc<RegexPidParser>,
}

impl ClusterBackend {
    pub fn new(section: &ClusterSection) -> Result<Self> {
        let parser = RegexPidParser::new(&section.job_id_regex).map_err(|e| {
            PipelineError::Configuration(format!("[cluster].job_id_regex: {e}"))
        })?;
        Ok(Self {
            section: section.clone(),
            parser: Arc::new(parser),
        })
    }

    fn job_script_path(task: &Task) -> PathBuf {
        sibling(&task.files().program, &format!("{}.job.sh", task.id))
    }

    fn stdin_path(task: &Task) -> PathBuf {
        sibling(&task.files().program, &format!("{}.stdin", task.id))
    }

    /// Route `argv` through the remote shell, if one is configured.
    fn remote(&self, argv: Vec<String>) -> Result<Vec<String>> {
        if self.section.remote_shell.is_empty() {
            return Ok(argv);
        }
        let joined = shlex::try_join(argv.iter().map(String::as_str))
            .map_err(|e| PipelineError::Configuration(format!("cannot quote command: {e}")))?;
        let mut out = self.section.remote_shell.clone();
        out.push(joined);
        Ok(out)
    }
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.with_file_name(name)
}

fn quote(path: &Path) -> Result<String> {
    let text = path_arg(path);
    shlex::try_quote(&text)
        .map(|q| q.into_owned())
        .map_err(|e| PipelineError::Configuration(format!("cannot quote path '{text}': {e}")))
}

/// Job script run by the scheduler on a compute node.
fn job_script(task: &Task, stdin: Option<&Path>) -> Result<String> {
    let files = task.files();
    let exit = quote(&files.exit_code)?;
    let exit_tmp = quote(&files.exit_code.with_extension("exitCode.tmp"))?;
    let mut run = format!(
        "sh {} >{} 2>{}",
        quote(&files.program)?,
        quote(&files.stdout)?,
        quote(&files.stderr)?
    );
    if let Some(stdin) = stdin {
        run.push_str(&format!(" <{}", quote(stdin)?));
    }
    Ok(format!(
        "#!/bin/sh\n{run}\necho $? >{exit_tmp}\nmv {exit_tmp} {exit}\n"
    ))
}

impl Backend for ClusterBackend {
    fn system(&self) -> SystemKind {
        SystemKind::Cluster
    }

    fn monitor_kind(&self) -> MonitorKind {
        MonitorKind::ExitFile
    }

    fn capacity(&self) -> usize {
        UNBOUNDED_CAPACITY
    }

    fn slots_for(&self, _task: &Task) -> usize {
        1
    }

    fn pid_parser(&self) -> Arc<dyn PidParser> {
        self.parser.clone()
    }

    fn cmd_tracks_task(&self) -> bool {
        false
    }

    fn prepare<'a>(&'a self, task: &'a Task, fs: &'a dyn FileSystem) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            write_program_file(fs, task)?;
            clear_previous_run(fs, task)?;
            let stdin = match &task.stdin {
                Some(text) => {
                    let path = Self::stdin_path(task);
                    fs.write(&path, text.as_bytes())?;
                    Some(path)
                }
                None => None,
            };
            let script = job_script(task, stdin.as_deref())?;
            fs.write(&Self::job_script_path(task), script.as_bytes())?;
            Ok(())
        })
    }

    fn build_run_argv(&self, task: &Task) -> Result<Vec<String>> {
        let values = [
            ("cpus", task.resources.get_any(&["cpus", "cpu"]).map(str::to_string)),
            ("mem", task.resources.get_any(&["mem", "memory"]).map(str::to_string)),
            ("task_id", Some(task.id.clone())),
            ("timeout_secs", task.timeout.map(|t| t.as_secs().to_string())),
        ];
        let mut argv = fill_argv(&self.section.submit, &values);
        argv.push(path_arg(&Self::job_script_path(task)));
        self.remote(argv)
    }

    fn build_kill_argv(&self, backend_id: &str) -> Vec<String> {
        let mut argv = self.section.kill.clone();
        argv.push(backend_id.to_string());
        // An unquotable id (NUL byte) falls back to the local kill argv.
        match self.remote(argv.clone()) {
            Ok(wrapped) => wrapped,
            Err(_) => argv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use crate::task::Resources;

    fn section(remote: &[&str]) -> ClusterSection {
        ClusterSection {
            remote_shell: remote.iter().map(|s| s.to_string()).collect(),
            submit: ["sbatch", "--parsable", "--cpus-per-task={cpus}", "--mem={mem}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            kill: vec!["scancel".to_string()],
            job_id_regex: r"^\s*(\d+)".to_string(),
        }
    }

    #[test]
    fn submit_is_wrapped_in_the_remote_shell() {
        let backend = ClusterBackend::new(&section(&["ssh", "head"])).unwrap();
        let mut resources = Resources::new();
        resources.insert("cpus", "8");
        let task = Task::new("align", "bwa mem", Path::new("/shared/w")).with_resources(resources);

        let argv = backend.build_run_argv(&task).unwrap();
        assert_eq!(&argv[..2], ["ssh", "head"]);
        assert_eq!(
            shlex::split(&argv[2]).unwrap(),
            vec!["sbatch", "--parsable", "--cpus-per-task=8", "/shared/w/align.job.sh"]
        );
        assert_eq!(backend.build_kill_argv("991"), vec!["ssh", "head", "scancel 991"]);
    }

    #[test]
    fn job_id_is_extracted_with_the_configured_regex() {
        let backend = ClusterBackend::new(&section(&[])).unwrap();
        assert_eq!(
            backend.pid_parser().parse("  4711;cluster0"),
            Some("4711".to_string())
        );
        assert_eq!(backend.pid_parser().parse("Submitted"), None);
    }

    #[test]
    fn bad_regex_is_a_configuration_error() {
        let mut s = section(&[]);
        s.job_id_regex = "(".to_string();
        assert!(matches!(
            ClusterBackend::new(&s),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn job_script_redirects_stdin_and_writes_exit_file() {
        let backend = ClusterBackend::new(&section(&[])).unwrap();
        let fs = MockFileSystem::new();
        let task = Task::new("t", "cat", Path::new("/w")).with_stdin(Some("data".into()));
        backend.prepare(&task, &fs).await.unwrap();

        let script = fs.read_to_string(Path::new("/w/t.job.sh")).unwrap();
        assert!(script.contains("sh /w/t.sh >/w/t.stdout 2>/w/t.stderr </w/t.stdin"), "{script}");
        assert!(script.ends_with("mv /w/t.exitCode.tmp /w/t.exitCode\n"));
        assert_eq!(fs.read_to_string(Path::new("/w/t.stdin")).unwrap(), "data");
    }
}
