use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Result};
use pipeworks::fs::FileSystem;

/// Filesystem wrapper that fails selected operations on demand.
///
/// Everything not switched to failing is forwarded to the wrapped
/// filesystem unchanged.
#[derive(Debug)]
pub struct FaultyFs {
    inner: Arc<dyn FileSystem>,
    fail_appends: AtomicBool,
    tear_writes: AtomicBool,
}

impl FaultyFs {
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self {
            inner,
            fail_appends: AtomicBool::new(false),
            tear_writes: AtomicBool::new(false),
        }
    }

    /// Every `append` returns an error and writes nothing.
    pub fn fail_appends(&self, on: bool) {
        self.fail_appends.store(on, Ordering::SeqCst);
    }

    /// Every `write` stores only the first half of the bytes and then errors,
    /// like a disk filling up mid-write.
    pub fn tear_writes(&self, on: bool) {
        self.tear_writes.store(on, Ordering::SeqCst);
    }
}

impl FileSystem for FaultyFs {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        self.inner.read_to_string(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if self.tear_writes.load(Ordering::SeqCst) {
            self.inner.write(path, &contents[..contents.len() / 2])?;
            bail!("no space left writing {:?}", path);
        }
        self.inner.write(path, contents)
    }

    fn append(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            bail!("cannot append to {:?}", path);
        }
        self.inner.append(path, contents)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.inner.remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.inner.is_file(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.inner.is_dir(path)
    }

    fn size(&self, path: &Path) -> Result<u64> {
        self.inner.size(path)
    }

    fn modified(&self, path: &Path) -> Result<SystemTime> {
        self.inner.modified(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.inner.read_dir(path)
    }
}
