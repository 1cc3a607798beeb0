// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::types::{parse_duration, LauncherKind, SystemKind};

/// Pipeline file as read from TOML, before validation.
///
/// ```toml
/// [config]
/// system = "local"
/// poll_interval = "250ms"
///
/// [local]
/// cpus = 4
///
/// [[task]]
/// id = "sort"
/// cmd = "sort data.txt > sorted.txt"
/// inputs = ["data.txt"]
/// outputs = ["sorted.txt"]
///
/// [[task]]
/// id = "count"
/// cmd = "wc -l sorted.txt > count.txt"
/// inputs = ["sorted.txt"]
/// outputs = ["count.txt"]
/// ```
///
/// Tasks are declared in file order; that order is also the order the
/// driver walks them in.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPipelineFile {
    #[serde(default)]
    pub config: ConfigSection,

    #[serde(default)]
    pub local: LocalSection,

    #[serde(default)]
    pub cluster: ClusterSection,

    #[serde(default)]
    pub cloud: CloudSection,

    #[serde(default)]
    pub task: Vec<TaskDecl>,
}

/// Validated pipeline file. Build it with `PipelineFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct PipelineFile {
    pub config: ConfigSection,
    pub local: LocalSection,
    pub cluster: ClusterSection,
    pub cloud: CloudSection,
    pub tasks: Vec<TaskDecl>,
    settings: RuntimeSettings,
}

impl PipelineFile {
    /// Used by validation once every invariant has been checked.
    pub(crate) fn new_unchecked(raw: RawPipelineFile, settings: RuntimeSettings) -> Self {
        Self {
            config: raw.config,
            local: raw.local,
            cluster: raw.cluster,
            cloud: raw.cloud,
            tasks: raw.task,
            settings,
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn work_dir(&self) -> &Path {
        &self.config.work_dir
    }

    /// Where checkpoints are written on fatal errors.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.config
            .checkpoint_file
            .clone()
            .unwrap_or_else(|| self.config.work_dir.join("pipeline.chp"))
    }

    /// System a declaration runs on, after applying the global default.
    pub fn system_for(&self, decl: &TaskDecl) -> SystemKind {
        decl.system.unwrap_or(self.config.system)
    }

    pub fn task(&self, id: &str) -> Option<&TaskDecl> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Durations and limits resolved from `[config]` during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub queue_length: usize,
    pub heartbeat_timeout: Option<Duration>,
    pub exit_file_grace: Duration,
    pub kill_on_shutdown: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            queue_length: default_queue_length(),
            heartbeat_timeout: None,
            exit_file_grace: Duration::from_secs(2),
            kill_on_shutdown: true,
        }
    }
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Default system for tasks that don't name one.
    #[serde(default)]
    pub system: SystemKind,

    /// How often executioner loops poll for completions (`"250ms"`).
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Bound on pending submissions per executioner.
    #[serde(default = "default_queue_length")]
    pub queue_length: usize,

    /// Directory holding program files and captured output.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Checkpoint location; defaults to `{work_dir}/pipeline.chp`.
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,

    /// Write a checkpoint before exiting on a fatal error.
    #[serde(default = "default_true")]
    pub checkpoint_on_fatal: bool,

    /// Kill running tasks on shutdown instead of draining them.
    #[serde(default = "default_true")]
    pub kill_on_shutdown: bool,

    /// Silence after which a queue-reporting task is killed (`"5m"`).
    #[serde(default)]
    pub heartbeat_timeout: Option<String>,

    /// How long a local wrapper may be gone before its exit file must exist.
    #[serde(default = "default_exit_file_grace")]
    pub exit_file_grace: String,
}

fn default_poll_interval() -> String {
    "250ms".to_string()
}

fn default_queue_length() -> usize {
    64
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".pipeworks")
}

fn default_exit_file_grace() -> String {
    "2s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            system: SystemKind::default(),
            poll_interval: default_poll_interval(),
            queue_length: default_queue_length(),
            work_dir: default_work_dir(),
            checkpoint_file: None,
            checkpoint_on_fatal: true,
            kill_on_shutdown: true,
            heartbeat_timeout: None,
            exit_file_grace: default_exit_file_grace(),
        }
    }
}

/// `[local]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocalSection {
    /// CPU slots; defaults to the host's available parallelism.
    #[serde(default)]
    pub cpus: Option<usize>,

    #[serde(default)]
    pub launcher: LauncherKind,
}

/// `[cluster]` section.
///
/// ```toml
/// [cluster]
/// remote_shell = ["ssh", "head-node"]
/// submit = ["sbatch", "--parsable", "--cpus-per-task={cpus}"]
/// kill = ["scancel"]
/// job_id_regex = '^\s*(\d+)'
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSection {
    /// Prefix used to reach the scheduler host (empty: run locally).
    #[serde(default)]
    pub remote_shell: Vec<String>,

    /// Submit command; the job script path is appended.
    #[serde(default)]
    pub submit: Vec<String>,

    /// Kill command; the job id is appended.
    #[serde(default)]
    pub kill: Vec<String>,

    #[serde(default = "default_id_regex")]
    pub job_id_regex: String,
}

fn default_id_regex() -> String {
    r"^\s*(\S+)".to_string()
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            remote_shell: Vec::new(),
            submit: Vec::new(),
            kill: Vec::new(),
            job_id_regex: default_id_regex(),
        }
    }
}

/// `[cloud]` section.
///
/// Provision/terminate/upload are argument templates; see
/// [`crate::executioner::cloud`] for the placeholders.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudSection {
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub image_id: Option<String>,

    #[serde(default)]
    pub instance_type: Option<String>,

    #[serde(default)]
    pub subnet_id: Option<String>,

    #[serde(default)]
    pub security_group_ids: Option<String>,

    /// Directory standing in for the checkpoint bucket (shared storage).
    #[serde(default)]
    pub bucket_dir: Option<PathBuf>,

    /// Upload command used when `bucket_dir` is unset.
    #[serde(default)]
    pub upload: Vec<String>,

    #[serde(default)]
    pub provision: Vec<String>,

    #[serde(default)]
    pub terminate: Vec<String>,

    #[serde(default = "default_id_regex")]
    pub instance_id_regex: String,

    /// Spool directory used as the message channel.
    #[serde(default)]
    pub queue_dir: Option<PathBuf>,

    /// Binary invoked by the startup script on the instance.
    #[serde(default = "default_instance_binary")]
    pub instance_binary: String,
}

fn default_instance_binary() -> String {
    "pipeworks".to_string()
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            region: None,
            image_id: None,
            instance_type: None,
            subnet_id: None,
            security_group_ids: None,
            bucket_dir: None,
            upload: Vec::new(),
            provision: Vec::new(),
            terminate: Vec::new(),
            instance_id_regex: default_id_regex(),
            queue_dir: None,
            instance_binary: default_instance_binary(),
        }
    }
}

/// One `[[task]]` declaration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TaskDecl {
    pub id: String,

    /// Shell text to run.
    pub cmd: String,

    /// Input files or ids of earlier tasks.
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,

    /// Ids of earlier tasks that must finish first.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub system: Option<SystemKind>,

    /// Maximum run time (`"10m"`).
    #[serde(default)]
    pub timeout: Option<String>,

    /// Text fed to the task's STDIN.
    #[serde(default)]
    pub stdin: Option<String>,

    #[serde(default)]
    pub can_fail: bool,

    #[serde(default)]
    pub allow_empty_output: bool,

    #[serde(default)]
    pub detached: bool,

    /// Backend resource request (`cpus`, `mem`, `instance-type`, ...).
    #[serde(default)]
    pub resources: BTreeMap<String, String>,

    /// Wait for every previously declared task before declaring this one.
    #[serde(default)]
    pub wait: bool,
}

impl TaskDecl {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(|t| parse_duration(t).ok())
    }

    /// Whether the declaration names any input or output file.
    pub fn has_io(&self) -> bool {
        !self.inputs.is_empty() || !self.outputs.is_empty()
    }
}
