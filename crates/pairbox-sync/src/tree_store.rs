use pairbox_core::{FileNode, FileTree, SyncError};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeChange {
    Set { path: String },
    Deleted { path: String },
    Renamed { from: String, to: String },
    Merged { paths: Vec<String> },
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNotice {
    pub revision: u64,
    pub change: TreeChange,
}

/// Authoritative path to contents map for the active project.
///
/// Every mutation completes before its notice is published, and snapshots
/// handed out by [`FileTreeStore::get`] are copy-on-write, so a subscriber
/// never sees a half-applied merge.
pub struct FileTreeStore {
    tree: Arc<FileTree>,
    revision: u64,
    changes: broadcast::Sender<TreeNotice>,
}

impl Default for FileTreeStore {
    fn default() -> Self {
        Self::new(FileTree::new())
    }
}

impl FileTreeStore {
    pub fn new(initial: FileTree) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tree: Arc::new(initial),
            revision: 0,
            changes,
        }
    }

    pub fn get(&self) -> Arc<FileTree> {
        self.tree.clone()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, path: &str) -> bool {
        self.tree.contains(path)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeNotice> {
        self.changes.subscribe()
    }

    pub fn set(&mut self, path: &str, node: FileNode) {
        Arc::make_mut(&mut self.tree).insert(path, node);
        self.publish(TreeChange::Set {
            path: path.to_string(),
        });
    }

    pub fn delete(&mut self, path: &str) -> Result<FileNode, SyncError> {
        let removed = Arc::make_mut(&mut self.tree)
            .remove(path)
            .ok_or_else(|| SyncError::FileNotFound {
                path: path.to_string(),
            })?;
        self.publish(TreeChange::Deleted {
            path: path.to_string(),
        });
        Ok(removed)
    }

    pub fn rename(&mut self, from: &str, to: &str, overwrite: bool) -> Result<(), SyncError> {
        if to.trim().is_empty() {
            return Err(SyncError::InvalidPath {
                path: to.to_string(),
            });
        }
        if !self.tree.contains(from) {
            return Err(SyncError::FileNotFound {
                path: from.to_string(),
            });
        }
        if from == to {
            return Ok(());
        }
        if self.tree.contains(to) && !overwrite {
            return Err(SyncError::TreeConflict {
                path: to.to_string(),
            });
        }
        let tree = Arc::make_mut(&mut self.tree);
        if let Some(node) = tree.remove(from) {
            tree.insert(to, node);
        }
        self.publish(TreeChange::Renamed {
            from: from.to_string(),
            to: to.to_string(),
        });
        Ok(())
    }

    /// Right-biased union with `incoming`. Returns the paths that changed.
    pub fn merge(&mut self, incoming: &FileTree) -> Vec<String> {
        if incoming.iter().all(|(path, node)| self.tree.get(path) == Some(node)) {
            debug!(event = "tree_merge_noop", paths = incoming.len());
            return Vec::new();
        }
        let changed = Arc::make_mut(&mut self.tree).merge_from(incoming);
        info!(
            event = "tree_merged",
            changed = changed.len(),
            total = self.tree.len()
        );
        self.publish(TreeChange::Merged {
            paths: changed.clone(),
        });
        changed
    }

    pub fn replace_all(&mut self, tree: FileTree) {
        self.tree = Arc::new(tree);
        self.publish(TreeChange::Replaced);
    }

    fn publish(&mut self, change: TreeChange) {
        self.revision += 1;
        // No receivers is fine; notices are advisory.
        let _ = self.changes.send(TreeNotice {
            revision: self.revision,
            change,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tree(entries: &[(&str, &str)]) -> FileTree {
        entries
            .iter()
            .map(|(path, contents)| (path.to_string(), FileNode::new(*contents)))
            .collect()
    }

    #[derive(Debug)]
    enum Op {
        Set(String, String),
        Merge(FileTree),
    }

    fn random_ops(rng: &mut StdRng, len: usize) -> Vec<Op> {
        const PATHS: [&str; 5] = ["a.js", "b.js", "src/c.js", "src/d.js", "package.json"];
        let pick = |rng: &mut StdRng| PATHS[rng.gen_range(0..PATHS.len())].to_string();
        (0..len)
            .map(|_| {
                let contents = format!("v{}", rng.gen_range(0..4));
                if rng.gen_bool(0.5) {
                    Op::Set(pick(rng), contents)
                } else {
                    let size = rng.gen_range(0..=3);
                    let incoming = (0..size)
                        .map(|_| (pick(rng), FileNode::new(format!("v{}", rng.gen_range(0..4)))))
                        .collect();
                    Op::Merge(incoming)
                }
            })
            .collect()
    }

    #[test]
    fn sequential_set_and_merge_match_replayed_union() {
        for seed in 0..32u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let initial = tree(&[("a.js", "0"), ("keep.js", "k")]);
            let ops = random_ops(&mut rng, 12);

            let mut store = FileTreeStore::new(initial.clone());
            let mut expected = initial;
            for op in &ops {
                match op {
                    Op::Set(path, contents) => {
                        store.set(path, FileNode::new(contents.clone()));
                        expected.insert(path.clone(), FileNode::new(contents.clone()));
                    }
                    Op::Merge(incoming) => {
                        store.merge(incoming);
                        for (path, node) in incoming.iter() {
                            expected.insert(path.clone(), node.clone());
                        }
                    }
                }
            }

            assert_eq!(*store.get(), expected, "seed {seed}: {ops:?}");
            assert_eq!(store.get().contents("keep.js"), Some("k"), "seed {seed}");
        }
    }

    #[test]
    fn merge_twice_equals_merge_once() {
        let incoming = tree(&[("a.js", "1"), ("b.js", "2")]);
        let mut store = FileTreeStore::new(tree(&[("keep.js", "k")]));

        assert_eq!(store.merge(&incoming).len(), 2);
        let after_once = store.get();
        let revision = store.revision();

        assert!(store.merge(&incoming).is_empty());
        assert_eq!(*store.get(), *after_once);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn rename_onto_existing_path_is_a_conflict_and_leaves_tree_alone() {
        let mut store = FileTreeStore::new(tree(&[("a.js", "A"), ("b.js", "B")]));
        let before = store.get();

        let err = store.rename("a.js", "b.js", false).expect_err("conflict");
        assert_eq!(
            err,
            SyncError::TreeConflict {
                path: "b.js".to_string()
            }
        );
        assert_eq!(*store.get(), *before);
    }

    #[test]
    fn rename_with_overwrite_moves_contents() {
        let mut store = FileTreeStore::new(tree(&[("a.js", "A"), ("b.js", "B")]));
        store.rename("a.js", "b.js", true).expect("rename");

        assert!(!store.contains("a.js"));
        assert_eq!(store.get().contents("b.js"), Some("A"));
        assert_eq!(store.get().len(), 1);
    }

    #[test]
    fn rename_missing_source_is_not_found() {
        let mut store = FileTreeStore::default();
        assert!(matches!(
            store.rename("ghost.js", "x.js", false),
            Err(SyncError::FileNotFound { .. })
        ));
    }

    #[test]
    fn snapshots_are_not_affected_by_later_mutations() {
        let mut store = FileTreeStore::new(tree(&[("a.js", "1")]));
        let snapshot = store.get();
        store.merge(&tree(&[("a.js", "2"), ("b.js", "3")]));

        assert_eq!(snapshot.contents("a.js"), Some("1"));
        assert!(!snapshot.contains("b.js"));
    }

    #[test]
    fn merge_publishes_one_notice_with_every_changed_path() {
        let mut store = FileTreeStore::new(tree(&[("a.js", "1")]));
        let mut rx = store.subscribe();

        store.merge(&tree(&[("a.js", "1"), ("b.js", "2"), ("c.js", "3")]));
        store.delete("a.js").expect("delete");

        let first = rx.try_recv().expect("merge notice");
        assert_eq!(
            first.change,
            TreeChange::Merged {
                paths: vec!["b.js".to_string(), "c.js".to_string()]
            }
        );
        let second = rx.try_recv().expect("delete notice");
        assert_eq!(second.revision, first.revision + 1);
        assert_eq!(
            second.change,
            TreeChange::Deleted {
                path: "a.js".to_string()
            }
        );
    }

    #[test]
    fn replace_all_discards_previous_state() {
        let mut store = FileTreeStore::new(tree(&[("old.js", "x")]));
        store.replace_all(tree(&[("new.js", "y")]));

        assert!(!store.contains("old.js"));
        assert_eq!(store.get().contents("new.js"), Some("y"));
    }
}
