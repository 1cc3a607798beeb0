// src/pipeline/context.rs

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::config::PipelineFile;
use crate::errors::Result;
use crate::executioner::{
    CloudBackend, CloudProvider, ClusterBackend, Executioner, LocalBackend,
};
use crate::fs::FileSystem;
use crate::monitor::MessageQueue;
use crate::task::TaskRegistry;
use crate::types::SystemKind;

/// State shared by everything that runs one pipeline: the task registry,
/// the filesystem, the validated configuration and one executioner per
/// system, started on first use.
pub struct Context {
    pub registry: TaskRegistry,
    pub fs: Arc<dyn FileSystem>,
    pub config: PipelineFile,
    executioners: Mutex<BTreeMap<SystemKind, Arc<Executioner>>>,
    cloud: Option<(Arc<dyn CloudProvider>, Arc<dyn MessageQueue>)>,
}

impl Context {
    pub fn new(config: PipelineFile, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            registry: TaskRegistry::new(),
            fs,
            config,
            executioners: Mutex::new(BTreeMap::new()),
            cloud: None,
        }
    }

    /// Use `provider` and `queue` for cloud tasks instead of the
    /// command-driven provider built from `[cloud]`.
    pub fn with_cloud_provider(
        mut self,
        provider: Arc<dyn CloudProvider>,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        self.cloud = Some((provider, queue));
        self
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SystemKind, Arc<Executioner>>> {
        self.executioners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Executioner for `system`, starting it if needed.
    pub fn executioner(&self, system: SystemKind) -> Result<Arc<Executioner>> {
        let mut executioners = self.lock();
        if let Some(existing) = executioners.get(&system) {
            return Ok(existing.clone());
        }

        let registry = self.registry.clone();
        let fs = self.fs.clone();
        let settings = self.config.settings().clone();
        let executioner = match system {
            SystemKind::Local => Executioner::spawn(
                LocalBackend::new(&self.config.local),
                registry,
                fs,
                settings,
            )?,
            SystemKind::Cluster => Executioner::spawn(
                ClusterBackend::new(&self.config.cluster)?,
                registry,
                fs,
                settings,
            )?,
            SystemKind::Cloud => {
                let backend = match &self.cloud {
                    Some((provider, queue)) => {
                        CloudBackend::new(&self.config.cloud, provider.clone(), queue.clone())?
                    }
                    None => CloudBackend::from_config(&self.config.cloud)?,
                };
                Executioner::spawn(backend, registry, fs, settings)?
            }
        };

        let executioner = Arc::new(executioner);
        executioners.insert(system, executioner.clone());
        Ok(executioner)
    }

    pub fn executioners(&self) -> Vec<Arc<Executioner>> {
        self.lock().values().cloned().collect()
    }

    /// Stop every executioner that was started.
    pub async fn shutdown(&self, drain: bool) {
        for executioner in self.executioners() {
            if let Err(e) = executioner.shutdown(drain).await {
                warn!(system = %executioner.system(), error = %e, "executioner shutdown failed");
            }
        }
    }
}
