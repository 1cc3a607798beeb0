// src/fs/mock.rs

//! In-memory filesystem with a logical clock.
//!
//! Every write stamps the entry with the next tick of an internal clock, so
//! "written later" always means "newer" without touching the wall clock.
//! Tests that need exact timestamps use [`MockFileSystem::set_modified`].

use super::FileSystem;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub enum MockEntry {
    File { content: Vec<u8>, modified: SystemTime },
    Dir { children: Vec<String>, modified: SystemTime },
}

impl MockEntry {
    fn modified(&self) -> SystemTime {
        match self {
            MockEntry::File { modified, .. } | MockEntry::Dir { modified, .. } => *modified,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    entries: HashMap<PathBuf, MockEntry>,
    clock: u64,
}

impl MockState {
    fn tick(&mut self) -> SystemTime {
        self.clock += 1;
        UNIX_EPOCH + Duration::from_secs(1_000_000 + self.clock)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    state: Arc<Mutex<MockState>>,
}

fn parent_of(path: &Path) -> Option<&Path> {
    path.parent().map(|p| {
        if p.as_os_str().is_empty() {
            Path::new(".")
        } else {
            p
        }
    })
}

impl MockFileSystem {
    pub fn new() -> Self {
        let fs = Self::default();
        {
            let mut state = fs.lock();
            let now = state.tick();
            state.entries.insert(
                PathBuf::from("."),
                MockEntry::Dir {
                    children: Vec::new(),
                    modified: now,
                },
            );
        }
        fs
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means another test thread panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.lock();
        let modified = state.tick();
        state.entries.insert(
            path.clone(),
            MockEntry::File {
                content: content.into(),
                modified,
            },
        );
        Self::link_to_parent(&mut state, &path);
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.lock();
        Self::ensure_dir_entry(&mut state, &path);
    }

    /// Force the modification time of an existing entry.
    pub fn set_modified(&self, path: impl AsRef<Path>, at: SystemTime) {
        let mut state = self.lock();
        match state.entries.get_mut(path.as_ref()) {
            Some(MockEntry::File { modified, .. }) | Some(MockEntry::Dir { modified, .. }) => {
                *modified = at;
            }
            None => {}
        }
    }

    fn link_to_parent(state: &mut MockState, path: &Path) {
        let Some(parent) = parent_of(path) else {
            return;
        };
        if parent == path {
            return;
        }
        Self::ensure_dir_entry(state, parent);
        if let Some(MockEntry::Dir { children, .. }) = state.entries.get_mut(parent) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if !children.iter().any(|c| c == name) {
                    children.push(name.to_string());
                }
            }
        }
    }

    fn ensure_dir_entry(state: &mut MockState, path: &Path) {
        if state.entries.contains_key(path) {
            return;
        }
        let modified = state.tick();
        state.entries.insert(
            path.to_path_buf(),
            MockEntry::Dir {
                children: Vec::new(),
                modified,
            },
        );
        Self::link_to_parent(state, path);
    }
}

impl FileSystem for MockFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        let state = self.lock();
        match state.entries.get(path) {
            Some(MockEntry::File { content, .. }) => {
                String::from_utf8(content.clone()).map_err(|e| anyhow!("Invalid UTF-8: {}", e))
            }
            Some(MockEntry::Dir { .. }) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.add_file(path, contents);
        Ok(())
    }

    fn append(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut state = self.lock();
        let now = state.tick();
        match state.entries.get_mut(path) {
            Some(MockEntry::File { content, modified }) => {
                content.extend_from_slice(contents);
                *modified = now;
                Ok(())
            }
            Some(MockEntry::Dir { .. }) => Err(anyhow!("Is a directory: {:?}", path)),
            None => {
                state.entries.insert(
                    path.to_path_buf(),
                    MockEntry::File {
                        content: contents.to_vec(),
                        modified: now,
                    },
                );
                Self::link_to_parent(&mut state, path);
                Ok(())
            }
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        match state.entries.get(path) {
            Some(MockEntry::File { .. }) => {
                state.entries.remove(path);
                if let Some(parent) = parent_of(path) {
                    if let Some(MockEntry::Dir { children, .. }) = state.entries.get_mut(parent) {
                        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                            children.retain(|c| c != name);
                        }
                    }
                }
                Ok(())
            }
            Some(MockEntry::Dir { .. }) => Err(anyhow!("Is a directory: {:?}", path)),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let content = match self.lock().entries.get(from) {
            Some(MockEntry::File { content, .. }) => content.clone(),
            Some(MockEntry::Dir { .. }) => return Err(anyhow!("Is a directory: {:?}", from)),
            None => return Err(anyhow!("File not found: {:?}", from)),
        };
        self.remove_file(from)?;
        self.add_file(to, content);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().entries.contains_key(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        matches!(self.lock().entries.get(path), Some(MockEntry::File { .. }))
    }

    fn is_dir(&self, path: &Path) -> bool {
        matches!(self.lock().entries.get(path), Some(MockEntry::Dir { .. }))
    }

    fn size(&self, path: &Path) -> Result<u64> {
        match self.lock().entries.get(path) {
            Some(MockEntry::File { content, .. }) => Ok(content.len() as u64),
            Some(MockEntry::Dir { .. }) => Ok(0),
            None => Err(anyhow!("File not found: {:?}", path)),
        }
    }

    fn modified(&self, path: &Path) -> Result<SystemTime> {
        self.lock()
            .entries
            .get(path)
            .map(MockEntry::modified)
            .ok_or_else(|| anyhow!("File not found: {:?}", path))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        match self.lock().entries.get(path) {
            Some(MockEntry::Dir { children, .. }) => {
                Ok(children.iter().map(|name| path.join(name)).collect())
            }
            _ => Err(anyhow!("Not a directory or not found: {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_writes_are_newer() {
        let fs = MockFileSystem::new();
        fs.add_file("a.txt", "a");
        fs.add_file("b.txt", "b");
        let a = fs.modified(Path::new("a.txt")).unwrap();
        let b = fs.modified(Path::new("b.txt")).unwrap();
        assert!(a < b);
    }

    #[test]
    fn parent_directories_are_listed() {
        let fs = MockFileSystem::new();
        fs.add_file("out/part-1", "x");
        assert!(fs.is_dir(Path::new("out")));
        assert_eq!(
            fs.read_dir(Path::new("out")).unwrap(),
            vec![PathBuf::from("out/part-1")]
        );

        fs.remove_file(Path::new("out/part-1")).unwrap();
        assert!(fs.read_dir(Path::new("out")).unwrap().is_empty());
    }
}
