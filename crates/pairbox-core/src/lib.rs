use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod chat;
pub mod error;
#[cfg(feature = "logging")]
pub mod logging;
pub mod protocol;

pub use chat::{AgentPayload, ChatMessage, MessageBody, Sender, DEFAULT_AGENT_IDENTITY};
pub use error::SyncError;

/// Stable identifier scoping one channel session, one file tree and one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    #[serde(default)]
    pub contents: String,
}

/// One file of a project. Serialized as `{"file":{"contents":"..."}}`, the
/// shape the sandbox mount interface and the persistence API both expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub file: FileContents,
}

impl FileNode {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            file: FileContents {
                contents: contents.into(),
            },
        }
    }

    pub fn contents(&self) -> &str {
        &self.file.contents
    }
}

/// Path to file mapping for a whole project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree(BTreeMap<String, FileNode>);

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&FileNode> {
        self.0.get(path)
    }

    pub fn contents(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(FileNode::contents)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, node: FileNode) -> Option<FileNode> {
        self.0.insert(path.into(), node)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileNode> {
        self.0.remove(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileNode)> {
        self.0.iter().map(|(path, node)| (path.as_str(), node))
    }

    /// Right-biased union: every incoming path overwrites, every other path is
    /// left alone. Returns the paths whose contents actually changed.
    pub fn merge_from(&mut self, incoming: &FileTree) -> Vec<String> {
        let mut changed = Vec::new();
        for (path, node) in &incoming.0 {
            if self.0.get(path) == Some(node) {
                continue;
            }
            self.0.insert(path.clone(), node.clone());
            changed.push(path.clone());
        }
        changed
    }

    pub fn merged(&self, incoming: &FileTree) -> FileTree {
        let mut out = self.clone();
        out.merge_from(incoming);
        out
    }
}

impl FromIterator<(String, FileNode)> for FileTree {
    fn from_iter<I: IntoIterator<Item = (String, FileNode)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
