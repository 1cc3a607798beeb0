// src/executioner/cloud.rs

//! Cloud instances.
//!
//! Launching a cloud task means:
//! 1. resolve instance parameters from the task's resources (with `[cloud]`
//!    defaults),
//! 2. save a single-task checkpoint and upload it to shared storage,
//! 3. write a startup script that runs `pipeworks task-exec` on it,
//! 4. run the provision command, whose first output line carries the
//!    instance id.
//!
//! The instance reports output and its exit status over the message queue,
//! so the queue monitor completes these tasks. Instances are terminated once
//! their task is terminal; the queue is deleted when the executioner stops.
//!
//! Provision template placeholders: `{region}`, `{image_id}`,
//! `{instance_type}`, `{subnet_id}`, `{security_group_ids}`, `{tags}`,
//! `{startup_script}`, `{checkpoint}`, `{task_id}`. Upload templates get
//! `{local}` and `{task_id}`; terminate templates get `{instance_id}` (or the
//! id is appended).

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::process::Command;
use tracing::{info, warn};

use crate::checkpoint::Checkpoint;
use crate::cmd::{run_kill_command, PidParser, RegexPidParser};
use crate::config::CloudSection;
use crate::errors::{PipelineError, Result};
use crate::fs::FileSystem;
use crate::monitor::{MessageQueue, SpoolQueue};
use crate::task::resources::parse_list;
use crate::task::{Task, TaskState};
use crate::types::{MonitorKind, SystemKind};

use super::backend::{
    clear_previous_run, fill_argv, mentions, path_arg, Backend, BackendFuture,
    UNBOUNDED_CAPACITY,
};

pub const REGION: &[&str] = &["region"];
pub const IMAGE_ID: &[&str] = &["image-id", "imageId"];
pub const INSTANCE_TYPE: &[&str] = &["instance-type", "instanceType"];
pub const SUBNET_ID: &[&str] = &["subnet-id", "subnetId"];
pub const SECURITY_GROUP_IDS: &[&str] = &[
    "security-group-ids",
    "securityGroupIds",
    "security-group-id",
    "securityGroupId",
];
pub const TAGS: &[&str] = &["tag-specifications", "tagSpecifications", "tags"];

/// Instance parameters for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudResources {
    pub region: String,
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub tags: Vec<(String, String)>,
}

impl CloudResources {
    /// Task resources win over `[cloud]` defaults. Region, image and
    /// instance type are mandatory.
    pub fn resolve(task: &Task, section: &CloudSection) -> Result<Self> {
        let lookup = |keys: &[&str], default: &Option<String>| {
            task.resources
                .get_any(keys)
                .map(str::to_string)
                .or_else(|| default.clone().filter(|v| !v.is_empty()))
        };
        let required = |name: &str, keys: &[&str], default: &Option<String>| {
            lookup(keys, default).ok_or_else(|| missing_parameter(name, &task.id, keys))
        };

        let region = required("region", REGION, &section.region)?;
        let image_id = required("image id", IMAGE_ID, &section.image_id)?;
        let instance_type = required("instance type", INSTANCE_TYPE, &section.instance_type)?;
        let subnet_id = lookup(SUBNET_ID, &section.subnet_id);
        let security_group_ids = lookup(SECURITY_GROUP_IDS, &section.security_group_ids)
            .map(|v| parse_list(&v))
            .unwrap_or_default();
        let tags = task
            .resources
            .get_any(TAGS)
            .map(parse_tags)
            .unwrap_or_default();

        Ok(Self {
            region,
            image_id,
            instance_type,
            subnet_id,
            security_group_ids,
            tags,
        })
    }
}

fn missing_parameter(name: &str, task_id: &str, keys: &[&str]) -> PipelineError {
    let accepted: Vec<String> = keys.iter().map(|k| format!("'{k}'")).collect();
    PipelineError::Configuration(format!(
        "Missing parameter '{name}' when attempting to run cloud task '{task_id}'. \
         Use resource entries (any of): {}",
        accepted.join(" ")
    ))
}

/// `key\tvalue` lines; lines without a tab become a tag with an empty value.
fn parse_tags(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| match line.split_once('\t') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

/// Everything a provider needs to start one instance.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub task_id: String,
    pub resources: CloudResources,
    pub startup_script: PathBuf,
    /// Remote location of the uploaded checkpoint.
    pub checkpoint: String,
}

/// Provider-specific operations. Implementations only build commands and
/// move checkpoint files; no provider SDK is involved.
pub trait CloudProvider: Send + Sync + Debug {
    /// Ship a local checkpoint; returns the location the instance reads.
    fn upload_checkpoint<'a>(&'a self, local: &'a Path, task_id: &'a str)
        -> BackendFuture<'a, String>;

    /// Command that starts an instance and prints its id first.
    fn provision_argv(&self, request: &ProvisionRequest) -> Result<Vec<String>>;

    fn terminate_argv(&self, instance_id: &str) -> Vec<String>;
}

/// Provider driven by the argument templates of `[cloud]`.
#[derive(Debug, Clone)]
pub struct CommandCloudProvider {
    section: CloudSection,
}

impl CommandCloudProvider {
    pub fn new(section: &CloudSection) -> Self {
        Self {
            section: section.clone(),
        }
    }

    async fn upload_with_command(&self, local: &Path, task_id: &str) -> Result<String> {
        let argv = fill_argv(
            &self.section.upload,
            &[
                ("local", Some(path_arg(local))),
                ("task_id", Some(task_id.to_string())),
            ],
        );
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PipelineError::Configuration("[cloud].upload is empty".into()))?;
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("running upload command '{program}'"))?;
        if !output.status.success() {
            return Err(PipelineError::Spawn {
                task: task_id.to_string(),
                reason: format!(
                    "checkpoint upload failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Spawn {
                task: task_id.to_string(),
                reason: "upload command did not print the checkpoint location".into(),
            })
    }
}

impl CloudProvider for CommandCloudProvider {
    fn upload_checkpoint<'a>(
        &'a self,
        local: &'a Path,
        task_id: &'a str,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            match &self.section.bucket_dir {
                Some(bucket) => {
                    let file_name = local
                        .file_name()
                        .map(|n| n.to_os_string())
                        .unwrap_or_else(|| format!("{task_id}.checkpoint.json").into());
                    let remote = bucket.join(file_name);
                    tokio::fs::create_dir_all(bucket)
                        .await
                        .with_context(|| format!("creating bucket dir {}", bucket.display()))?;
                    tokio::fs::copy(local, &remote)
                        .await
                        .with_context(|| format!("copying checkpoint to {}", remote.display()))?;
                    Ok(path_arg(&remote))
                }
                None => self.upload_with_command(local, task_id).await,
            }
        })
    }

    fn provision_argv(&self, request: &ProvisionRequest) -> Result<Vec<String>> {
        let r = &request.resources;
        let groups = (!r.security_group_ids.is_empty()).then(|| r.security_group_ids.join(","));
        let tags = (!r.tags.is_empty()).then(|| {
            r.tags
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        });
        let values = [
            ("region", Some(r.region.clone())),
            ("image_id", Some(r.image_id.clone())),
            ("instance_type", Some(r.instance_type.clone())),
            ("subnet_id", r.subnet_id.clone()),
            ("security_group_ids", groups),
            ("tags", tags),
            ("startup_script", Some(path_arg(&request.startup_script))),
            ("checkpoint", Some(request.checkpoint.clone())),
            ("task_id", Some(request.task_id.clone())),
        ];
        Ok(fill_argv(&self.section.provision, &values))
    }

    fn terminate_argv(&self, instance_id: &str) -> Vec<String> {
        let template = &self.section.terminate;
        if mentions(template, "instance_id") {
            fill_argv(template, &[("instance_id", Some(instance_id.to_string()))])
        } else {
            let mut argv = template.clone();
            argv.push(instance_id.to_string());
            argv
        }
    }
}

#[derive(Debug)]
pub struct CloudBackend {
    section: CloudSection,
    provider: Arc<dyn CloudProvider>,
    queue: Arc<dyn MessageQueue>,
    parser: Arc<RegexPidParser>,
    /// Uploaded checkpoint location per task, filled by `prepare`.
    remote_checkpoints: Mutex<HashMap<String, String>>,
}

impl CloudBackend {
    pub fn new(
        section: &CloudSection,
        provider: Arc<dyn CloudProvider>,
        queue: Arc<dyn MessageQueue>,
    ) -> Result<Self> {
        let parser = RegexPidParser::new(&section.instance_id_regex).map_err(|e| {
            PipelineError::Configuration(format!("[cloud].instance_id_regex: {e}"))
        })?;
        Ok(Self {
            section: section.clone(),
            provider,
            queue,
            parser: Arc::new(parser),
            remote_checkpoints: Mutex::new(HashMap::new()),
        })
    }

    /// Command-driven provider with a spool-directory queue.
    pub fn from_config(section: &CloudSection) -> Result<Self> {
        let queue_dir = section.queue_dir.clone().ok_or_else(|| {
            PipelineError::Configuration("[cloud].queue_dir is required for cloud tasks".into())
        })?;
        let queue: Arc<dyn MessageQueue> = Arc::new(SpoolQueue::open(queue_dir)?);
        Self::new(section, Arc::new(CommandCloudProvider::new(section)), queue)
    }

    fn remote_checkpoint(&self, task_id: &str) -> Option<String> {
        self.remote_checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
    }

    fn queue_location(&self) -> String {
        self.section
            .queue_dir
            .as_deref()
            .map(path_arg)
            .unwrap_or_else(|| self.queue.name().to_string())
    }

    fn startup_script(&self, remote_checkpoint: &str) -> Result<String> {
        let quote = |s: &str| {
            shlex::try_quote(s)
                .map(|q| q.into_owned())
                .map_err(|e| PipelineError::Configuration(format!("cannot quote '{s}': {e}")))
        };
        Ok(format!(
            "#!/bin/sh\nexec {} task-exec --checkpoint {} --queue {}\n",
            quote(&self.section.instance_binary)?,
            quote(remote_checkpoint)?,
            quote(&self.queue_location())?
        ))
    }
}

fn sibling(task: &Task, suffix: &str) -> PathBuf {
    task.files()
        .program
        .with_file_name(format!("{}.{suffix}", task.id))
}

impl Backend for CloudBackend {
    fn system(&self) -> SystemKind {
        SystemKind::Cloud
    }

    fn monitor_kind(&self) -> MonitorKind {
        MonitorKind::Queue
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

    fn message_queue(&self) -> Option<Arc<dyn MessageQueue>> {
        Some(self.queue.clone())
    }

    fn prepare<'a>(&'a self, task: &'a Task, fs: &'a dyn FileSystem) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            CloudResources::resolve(task, &self.section)?;
            clear_previous_run(fs, task)?;

            let local = sibling(task, "checkpoint.json");
            Checkpoint::for_task(task).save(fs, &local)?;
            let remote = self.provider.upload_checkpoint(&local, &task.id).await?;
            info!(task = %task.id, checkpoint = %remote, "checkpoint uploaded");

            let script = self.startup_script(&remote)?;
            fs.write(&sibling(task, "startup.sh"), script.as_bytes())?;

            self.remote_checkpoints
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(task.id.clone(), remote);
            Ok(())
        })
    }

    fn build_run_argv(&self, task: &Task) -> Result<Vec<String>> {
        let resources = CloudResources::resolve(task, &self.section)?;
        let checkpoint = self.remote_checkpoint(&task.id).ok_or_else(|| {
            PipelineError::ContractViolation(format!(
                "cloud task '{}' was not prepared before launch",
                task.id
            ))
        })?;
        self.provider.provision_argv(&ProvisionRequest {
            task_id: task.id.clone(),
            resources,
            startup_script: sibling(task, "startup.sh"),
            checkpoint,
        })
    }

    fn build_kill_argv(&self, backend_id: &str) -> Vec<String> {
        self.provider.terminate_argv(backend_id)
    }

    fn after_finish<'a>(&'a self, task: &'a Task) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.remote_checkpoints
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&task.id);
            // A kill already ran the terminate command.
            if task.state() == TaskState::FinishedKilled {
                return Ok(());
            }
            if let Some(instance) = task.backend_id() {
                info!(task = %task.id, instance = %instance, "terminating instance");
                if let Err(e) = run_kill_command(&self.provider.terminate_argv(instance)).await {
                    warn!(task = %task.id, instance = %instance, error = %e, "terminate failed");
                }
            }
            Ok(())
        })
    }

    fn shutdown(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            info!(queue = %self.queue.name(), "deleting message queue");
            self.queue.delete()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Resources;

    fn section() -> CloudSection {
        CloudSection {
            region: Some("us-east-1".into()),
            provision: [
                "cloudctl",
                "run",
                "--region={region}",
                "--image={image_id}",
                "--type={instance_type}",
                "--subnet={subnet_id}",
                "--groups={security_group_ids}",
                "--user-data={startup_script}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            terminate: vec!["cloudctl".into(), "terminate".into()],
            ..CloudSection::default()
        }
    }

    fn task_with(pairs: &[(&str, &str)]) -> Task {
        let mut resources = Resources::new();
        for (k, v) in pairs {
            resources.insert(*k, *v);
        }
        Task::new("t", "true", Path::new("/w")).with_resources(resources)
    }

    #[test]
    fn aliases_and_defaults_resolve() {
        let task = task_with(&[
            ("imageId", "ami-1"),
            ("instance-type", "m5.large"),
            ("securityGroupIds", "sg-1;sg-2"),
            ("tags", "team\tgenomics\nowner\tops"),
        ]);
        let r = CloudResources::resolve(&task, &section()).unwrap();
        assert_eq!(r.region, "us-east-1");
        assert_eq!(r.image_id, "ami-1");
        assert_eq!(r.security_group_ids, vec!["sg-1", "sg-2"]);
        assert_eq!(r.tags[0], ("team".to_string(), "genomics".to_string()));
        assert_eq!(r.subnet_id, None);
    }

    #[test]
    fn missing_instance_type_names_accepted_keys() {
        let task = task_with(&[("image-id", "ami-1")]);
        match CloudResources::resolve(&task, &section()) {
            Err(PipelineError::Configuration(msg)) => {
                assert!(msg.contains("cloud task 't'"), "{msg}");
                assert!(msg.contains("'instance-type' 'instanceType'"), "{msg}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn provision_argv_drops_unset_optional_flags() {
        let provider = CommandCloudProvider::new(&section());
        let task = task_with(&[("image-id", "ami-1"), ("instance-type", "t3.micro")]);
        let request = ProvisionRequest {
            task_id: "t".into(),
            resources: CloudResources::resolve(&task, &section()).unwrap(),
            startup_script: PathBuf::from("/w/t.startup.sh"),
            checkpoint: "/bucket/t.checkpoint.json".into(),
        };
        assert_eq!(
            provider.provision_argv(&request).unwrap(),
            vec![
                "cloudctl",
                "run",
                "--region=us-east-1",
                "--image=ami-1",
                "--type=t3.micro",
                "--user-data=/w/t.startup.sh"
            ]
        );
        assert_eq!(provider.terminate_argv("i-9"), vec!["cloudctl", "terminate", "i-9"]);
    }
}
