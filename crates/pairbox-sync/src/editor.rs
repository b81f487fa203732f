use crate::tree_store::FileTreeStore;
use pairbox_core::{FileNode, FileTree, SyncError};
use tokio::sync::broadcast;
use tracing::debug;

const NEW_FILE_PREFIX: &str = "newFile";
const NEW_FILE_EXTENSION: &str = ".js";
const OPEN_SET_CHANNEL_CAPACITY: usize = 64;

/// The tabs and focus after a change to either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSetNotice {
    pub open: Vec<String>,
    pub active: Option<String>,
}

/// Open tabs and the focused file. Every open path exists in the tree.
#[derive(Debug)]
pub struct EditorBuffer {
    open: Vec<String>,
    active: Option<String>,
    changes: broadcast::Sender<OpenSetNotice>,
}

impl Default for EditorBuffer {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(OPEN_SET_CHANNEL_CAPACITY);
        Self {
            open: Vec::new(),
            active: None,
            changes,
        }
    }
}

impl EditorBuffer {
    pub fn subscribe(&self) -> broadcast::Receiver<OpenSetNotice> {
        self.changes.subscribe()
    }

    pub fn open_files(&self) -> &[String] {
        &self.open
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.open.iter().any(|open| open == path)
    }

    pub fn open(&mut self, store: &FileTreeStore, path: &str) -> Result<(), SyncError> {
        if !store.contains(path) {
            return Err(SyncError::FileNotFound {
                path: path.to_string(),
            });
        }
        let before = (self.open.len(), self.active.clone());
        if !self.is_open(path) {
            self.open.push(path.to_string());
        }
        self.active = Some(path.to_string());
        if before != (self.open.len(), self.active.clone()) {
            self.publish();
        }
        Ok(())
    }

    pub fn close(&mut self, path: &str) -> bool {
        let before = self.open.len();
        self.open.retain(|open| open != path);
        if self.open.len() == before {
            return false;
        }
        if self.active.as_deref() == Some(path) {
            self.active = self.open.first().cloned();
        }
        self.publish();
        true
    }

    /// Writes `contents` and returns the one-file fragment to broadcast.
    pub fn commit(
        &self,
        store: &mut FileTreeStore,
        path: &str,
        contents: impl Into<String>,
    ) -> Result<FileTree, SyncError> {
        if path.trim().is_empty() {
            return Err(SyncError::InvalidPath {
                path: path.to_string(),
            });
        }
        let node = FileNode::new(contents);
        store.set(path, node.clone());
        let mut fragment = FileTree::new();
        fragment.insert(path, node);
        Ok(fragment)
    }

    /// Adds an empty `newFile<n>.js` using the lowest free `n` and focuses it.
    pub fn create_file(&mut self, store: &mut FileTreeStore) -> String {
        let mut counter = 1u32;
        let mut path = format!("{NEW_FILE_PREFIX}{counter}{NEW_FILE_EXTENSION}");
        while store.contains(&path) {
            counter += 1;
            path = format!("{NEW_FILE_PREFIX}{counter}{NEW_FILE_EXTENSION}");
        }
        store.set(&path, FileNode::default());
        self.open.push(path.clone());
        self.active = Some(path.clone());
        self.publish();
        debug!(event = "file_created", path = %path);
        path
    }

    pub fn rename(
        &mut self,
        store: &mut FileTreeStore,
        from: &str,
        to: &str,
        overwrite: bool,
    ) -> Result<(), SyncError> {
        store.rename(from, to, overwrite)?;
        if from == to {
            return Ok(());
        }
        let touched = self.is_open(from) || self.is_open(to);
        // An overwritten target tab folds into the renamed one.
        if self.is_open(from) {
            self.open.retain(|open| open != to);
        }
        for open in self.open.iter_mut() {
            if open == from {
                *open = to.to_string();
            }
        }
        if self.active.as_deref() == Some(from) {
            self.active = Some(to.to_string());
        }
        if touched {
            self.publish();
        }
        Ok(())
    }

    /// Removes `path` from the tree; closing its tab publishes the new open set.
    pub fn delete(&mut self, store: &mut FileTreeStore, path: &str) -> Result<(), SyncError> {
        store.delete(path)?;
        self.close(path);
        Ok(())
    }

    pub fn reset(&mut self) {
        if self.open.is_empty() && self.active.is_none() {
            return;
        }
        self.open.clear();
        self.active = None;
        self.publish();
    }

    fn publish(&self) {
        let _ = self.changes.send(OpenSetNotice {
            open: self.open.clone(),
            active: self.active.clone(),
        });
    }
}
