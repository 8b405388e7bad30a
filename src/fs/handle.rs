//! Open file handle table

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::session::FileSession;
use crate::error::{Error, Result};

/// Maps kernel file handles to open sessions
pub struct HandleTable {
    next_fh: AtomicU64,
    sessions: RwLock<HashMap<u64, Arc<FileSession>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a new file handle
    pub fn alloc(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a session under its handle
    pub fn register(&self, session: FileSession) -> u64 {
        let fh = session.fh();
        self.sessions.write().insert(fh, Arc::new(session));
        fh
    }

    /// Get session by handle
    pub fn get(&self, fh: u64) -> Result<Arc<FileSession>> {
        self.sessions
            .read()
            .get(&fh)
            .cloned()
            .ok_or(Error::BadHandle(fh))
    }

    /// Remove a session
    pub fn remove(&self, fh: u64) -> Result<Arc<FileSession>> {
        self.sessions.write().remove(&fh).ok_or(Error::BadHandle(fh))
    }

    /// Remove every session
    pub fn drain(&self) -> Vec<Arc<FileSession>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
