#![allow(dead_code)]

use std::path::Path;

use pipeworks::config::{CloudSection, PipelineFile, RawPipelineFile, TaskDecl};
use pipeworks::types::SystemKind;

/// Builder for `PipelineFile` to simplify test setup.
///
/// Defaults are tuned for tests: a 20ms poll interval and a short exit-file
/// grace so failures surface quickly.
pub struct PipelineFileBuilder {
    raw: RawPipelineFile,
}

impl PipelineFileBuilder {
    pub fn new(work_dir: &Path) -> Self {
        let mut raw = RawPipelineFile::default();
        raw.config.work_dir = work_dir.to_path_buf();
        raw.config.poll_interval = "20ms".to_string();
        raw.config.exit_file_grace = "500ms".to_string();
        Self { raw }
    }

    pub fn with_task(mut self, task: TaskDecl) -> Self {
        self.raw.task.push(task);
        self
    }

    pub fn system(mut self, system: SystemKind) -> Self {
        self.raw.config.system = system;
        self
    }

    pub fn cpus(mut self, cpus: usize) -> Self {
        self.raw.local.cpus = Some(cpus);
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: &str) -> Self {
        self.raw.config.heartbeat_timeout = Some(timeout.to_string());
        self
    }

    pub fn checkpoint_on_fatal(mut self, enabled: bool) -> Self {
        self.raw.config.checkpoint_on_fatal = enabled;
        self
    }

    /// A `[cloud]` section that passes validation. The commands are never
    /// run when a fake provider is installed on the context.
    pub fn fake_cloud(mut self, queue_dir: &Path) -> Self {
        self.raw.cloud = CloudSection {
            region: Some("test-region-1".into()),
            image_id: Some("img-test".into()),
            instance_type: Some("t.small".into()),
            bucket_dir: Some(queue_dir.join("bucket")),
            provision: vec!["true".into()],
            terminate: vec!["true".into()],
            queue_dir: Some(queue_dir.to_path_buf()),
            ..CloudSection::default()
        };
        self
    }

    pub fn raw(self) -> RawPipelineFile {
        self.raw
    }

    pub fn build(self) -> PipelineFile {
        PipelineFile::try_from(self.raw).expect("Failed to build valid pipeline from builder")
    }
}

/// Builder for `TaskDecl`.
pub struct TaskDeclBuilder {
    task: TaskDecl,
}

impl TaskDeclBuilder {
    pub fn new(id: &str, cmd: &str) -> Self {
        Self {
            task: TaskDecl {
                id: id.to_string(),
                cmd: cmd.to_string(),
                inputs: vec![],
                outputs: vec![],
                after: vec![],
                system: None,
                timeout: None,
                stdin: None,
                can_fail: false,
                allow_empty_output: false,
                detached: false,
                resources: Default::default(),
                wait: false,
            },
        }
    }

    pub fn input(mut self, input: impl AsRef<Path>) -> Self {
        self.task.inputs.push(input.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn output(mut self, output: impl AsRef<Path>) -> Self {
        self.task.outputs.push(output.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.after.push(dep.to_string());
        self
    }

    pub fn system(mut self, system: SystemKind) -> Self {
        self.task.system = Some(system);
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.task.timeout = Some(timeout.to_string());
        self
    }

    pub fn stdin(mut self, text: &str) -> Self {
        self.task.stdin = Some(text.to_string());
        self
    }

    pub fn can_fail(mut self) -> Self {
        self.task.can_fail = true;
        self
    }

    pub fn allow_empty_output(mut self) -> Self {
        self.task.allow_empty_output = true;
        self
    }

    pub fn detached(mut self) -> Self {
        self.task.detached = true;
        self
    }

    pub fn wait(mut self) -> Self {
        self.task.wait = true;
        self
    }

    pub fn resource(mut self, key: &str, value: &str) -> Self {
        self.task.resources.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> TaskDecl {
        self.task
    }
}
