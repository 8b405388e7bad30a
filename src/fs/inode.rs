//! Inode number allocation
//!
//! The kernel addresses entries by inode; the dispatcher works on virtual
//! paths. This table maps between the two.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Inode of the mount root
pub const ROOT_INO: u64 = 1;

/// Bidirectional inode/path map
pub struct InodeTable {
    /// Next inode number
    next_ino: AtomicU64,
    /// ino -> virtual path
    paths: RwLock<HashMap<u64, PathBuf>>,
    /// virtual path -> ino
    inos: RwLock<HashMap<PathBuf, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            paths: RwLock::new(HashMap::new()),
            inos: RwLock::new(HashMap::new()),
        };

        let root = PathBuf::from("/");
        table.paths.write().insert(ROOT_INO, root.clone());
        table.inos.write().insert(root, ROOT_INO);
        table
    }

    /// Path of a known inode
    pub fn path_of(&self, ino: u64) -> Result<PathBuf> {
        self.paths
            .read()
            .get(&ino)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }

    /// Path of `name` inside directory inode `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        Ok(self.path_of(parent)?.join(name))
    }

    /// Inode for `path`, allocating one on first sight
    pub fn ino_for(&self, path: &Path) -> u64 {
        if let Some(&ino) = self.inos.read().get(path) {
            return ino;
        }

        let mut inos = self.inos.write();
        // Another thread may have inserted it between the locks
        if let Some(&ino) = inos.get(path) {
            return ino;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        inos.insert(path.to_path_buf(), ino);
        self.paths.write().insert(ino, path.to_path_buf());
        ino
    }

    /// Inode of the directory containing `path`
    pub fn parent_ino(&self, path: &Path) -> u64 {
        match path.parent() {
            Some(parent) => self.ino_for(parent),
            None => ROOT_INO,
        }
    }

    /// Drop an inode the kernel no longer references
    pub fn forget(&self, ino: u64) {
        if ino == ROOT_INO {
            return;
        }
        // Same lock order as ino_for: inos, then paths
        let mut inos = self.inos.write();
        if let Some(path) = self.paths.write().remove(&ino) {
            inos.remove(&path);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.read().is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).unwrap(), PathBuf::from("/"));
        assert_eq!(table.ino_for(Path::new("/")), ROOT_INO);
        assert_eq!(table.parent_ino(Path::new("/")), ROOT_INO);
    }

    #[test]
    fn test_allocation_is_stable() {
        let table = InodeTable::new();
        let path = table.child_path(ROOT_INO, OsStr::new("dir")).unwrap();
        assert_eq!(path, PathBuf::from("/dir"));

        let ino = table.ino_for(&path);
        assert_ne!(ino, ROOT_INO);
        assert_eq!(table.ino_for(&path), ino);
        assert_eq!(table.path_of(ino).unwrap(), path);

        let child = table.child_path(ino, OsStr::new("f")).unwrap();
        let child_ino = table.ino_for(&child);
        assert_eq!(table.parent_ino(&child), ino);
        assert_eq!(table.len(), 3);
        assert_ne!(child_ino, ino);
    }

    #[test]
    fn test_forget() {
        let table = InodeTable::new();
        let ino = table.ino_for(Path::new("/a"));
        table.forget(ino);
        assert!(matches!(table.path_of(ino), Err(Error::NotFound(_))));

        table.forget(ROOT_INO);
        assert!(table.path_of(ROOT_INO).is_ok());
    }

    #[test]
    fn test_concurrent_lookup_and_forget() {
        use std::sync::{mpsc, Arc};
        use std::time::Duration;

        let table = Arc::new(InodeTable::new());
        let (done_tx, done_rx) = mpsc::channel();

        let mut workers = Vec::new();
        for t in 0..6u64 {
            let table = Arc::clone(&table);
            let done_tx = done_tx.clone();
            workers.push(std::thread::spawn(move || {
                for round in 0..2000u64 {
                    if t < 4 {
                        table.ino_for(&PathBuf::from(format!("/f{}", round % 4)));
                    } else {
                        table.forget(2 + round % 70);
                    }
                }
                done_tx.send(()).unwrap();
            }));
        }
        drop(done_tx);

        for _ in 0..6 {
            done_rx
                .recv_timeout(Duration::from_secs(30))
                .expect("lookup and forget deadlocked");
        }
        for worker in workers {
            worker.join().unwrap();
        }

        // Every surviving mapping is consistent in both directions
        for i in 0..4 {
            let path = PathBuf::from(format!("/f{}", i));
            let ino = table.ino_for(&path);
            assert_eq!(table.path_of(ino).unwrap(), path);
        }
    }
}
