#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use pipeworks::errors::Result;
use pipeworks::executioner::{BackendFuture, CloudProvider, ProvisionRequest};
use pipeworks::monitor::{MemoryQueue, Message, MessageKind, MessageQueue};

/// What a fake instance "does" for one task.
#[derive(Debug, Clone)]
pub struct FakeRun {
    pub stdout: String,
    pub stderr: String,
    /// Exit text; `None` means the instance never reports back.
    pub exit: Option<String>,
    /// Files created on the shared filesystem before the exit message.
    pub writes: Vec<(PathBuf, String)>,
}

impl Default for FakeRun {
    fn default() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit: Some("0".to_string()),
            writes: Vec::new(),
        }
    }
}

impl FakeRun {
    pub fn exit(text: &str) -> Self {
        Self {
            exit: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            exit: None,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.stdout = text.to_string();
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.stderr = text.to_string();
        self
    }

    pub fn writes(mut self, path: &Path, contents: &str) -> Self {
        self.writes.push((path.to_path_buf(), contents.to_string()));
        self
    }
}

/// Cloud provider that never leaves the test process.
///
/// Provisioning prints `i-<task id>` and immediately plays the task's
/// [`FakeRun`] into an in-memory queue, the way `task-exec` on a real
/// instance would.
#[derive(Debug)]
pub struct FakeCloud {
    queue: Arc<MemoryQueue>,
    runs: Mutex<HashMap<String, FakeRun>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    provisioned: Mutex<Vec<ProvisionRequest>>,
    terminated: Mutex<Vec<String>>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::new(MemoryQueue::new("fake-cloud")),
            runs: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            provisioned: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        })
    }

    pub fn queue(&self) -> Arc<dyn MessageQueue> {
        self.queue.clone()
    }

    pub fn script(&self, task_id: &str, run: FakeRun) {
        self.runs.lock().unwrap().insert(task_id.to_string(), run);
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.provisioned
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.task_id.clone())
            .collect()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    fn play(&self, task_id: &str) -> Result<()> {
        let run = self.runs.lock().unwrap().get(task_id).cloned().unwrap_or_default();
        let send = |kind, payload: &str| {
            self.queue
                .send(&Message::new(task_id, kind, payload.as_bytes().to_vec()).encode())
        };
        if !run.stdout.is_empty() {
            send(MessageKind::Stdout, &run.stdout)?;
        }
        if !run.stderr.is_empty() {
            send(MessageKind::Stderr, &run.stderr)?;
        }
        for (path, contents) in &run.writes {
            std::fs::write(path, contents)?;
        }
        if let Some(exit) = &run.exit {
            send(MessageKind::Exit, exit)?;
        }
        Ok(())
    }
}

impl CloudProvider for FakeCloud {
    fn upload_checkpoint<'a>(&'a self, local: &'a Path, task_id: &'a str) -> BackendFuture<'a, String> {
        Box::pin(async move {
            let remote = format!("fake://checkpoints/{task_id}");
            self.uploads
                .lock()
                .unwrap()
                .push((local.to_path_buf(), remote.clone()));
            Ok(remote)
        })
    }

    fn provision_argv(&self, request: &ProvisionRequest) -> Result<Vec<String>> {
        self.provisioned.lock().unwrap().push(request.clone());
        self.play(&request.task_id)?;
        Ok(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo i-{}", request.task_id),
        ])
    }

    fn terminate_argv(&self, instance_id: &str) -> Vec<String> {
        self.terminated.lock().unwrap().push(instance_id.to_string());
        vec!["true".to_string()]
    }
}
