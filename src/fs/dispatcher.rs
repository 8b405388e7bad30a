//! Path-level filesystem operations
//!
//! Everything the mount can do, expressed over virtual paths and file
//! handles. The tree is a read-only mirror of the source directory: file
//! contents are encrypted on the way out, metadata passes through, and
//! every mutation is rejected before it reaches storage.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::attr::{FileAttributes, FileKind};
use super::handle::HandleTable;
use super::lower::{FsStats, LowerLayer};
use super::session::FileSession;
use crate::config::Config;
use crate::crypto::KeyManager;
use crate::error::{Error, Result};

/// Directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

/// Reverse-encrypting filesystem over a plaintext source tree
pub struct ReverseFs {
    lower: LowerLayer,
    keys: Arc<KeyManager>,
    handles: HandleTable,
    scratch_retain: usize,
}

impl ReverseFs {
    pub fn new(config: &Config, keys: Arc<KeyManager>) -> Result<Self> {
        let lower = LowerLayer::new(config.source_dir.clone())?;
        Ok(Self {
            lower,
            keys,
            handles: HandleTable::new(),
            scratch_retain: config.read.scratch_retain_bytes,
        })
    }

    pub fn source_dir(&self) -> &Path {
        self.lower.root()
    }

    /// Number of open file handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Verify the source root before serving requests
    pub fn init(&self) -> Result<()> {
        let meta = self.lower.metadata(Path::new("/"))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(
                self.lower.root().to_string_lossy().to_string(),
            ));
        }
        info!(
            "serving {} (key {})",
            self.lower.root().display(),
            self.keys.fingerprint()
        );
        Ok(())
    }

    /// Close every open session
    pub fn destroy(&self) {
        let sessions = self.handles.drain();
        if !sessions.is_empty() {
            info!("closing {} open handles", sessions.len());
        }
        for session in sessions {
            if let Err(e) = session.close() {
                warn!("close {} failed: {}", session.path().display(), e);
            }
        }
    }

    /// Attributes of `path`; size equals the plaintext size
    pub fn getattr(&self, path: &Path) -> Result<FileAttributes> {
        let meta = self.lower.metadata(path)?;
        Ok(FileAttributes::from_metadata(&meta))
    }

    /// Names and kinds under a directory, sorted by name
    pub fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
        Ok(self
            .lower
            .readdir(path)?
            .into_iter()
            .map(|e| DirEntry {
                name: e.name,
                kind: e.kind,
            })
            .collect())
    }

    /// Links are served as what they point at, so none can be read
    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        self.lower.metadata(path)?;
        Err(Error::NotFound(path.to_string_lossy().to_string()))
    }

    pub fn statfs(&self) -> Result<FsStats> {
        self.lower.statfs()
    }

    /// Check access; write access is never granted
    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        self.lower.metadata(path)?;
        if mask & libc::W_OK != 0 {
            return Err(Error::read_only("access"));
        }
        Ok(())
    }

    /// Open a regular file for reading and return its handle
    pub fn open(&self, path: &Path, flags: i32) -> Result<u64> {
        let accmode = flags & libc::O_ACCMODE;
        let modifying = libc::O_TRUNC | libc::O_CREAT | libc::O_APPEND;
        if accmode != libc::O_RDONLY || flags & modifying != 0 {
            return self.reject("open for write", path);
        }

        let file = self.lower.open_file(path)?;
        let fh = self.handles.alloc();
        let session = FileSession::new(fh, path, file, self.keys.clone(), self.scratch_retain);
        self.handles.register(session);

        debug!("open {} -> fh {}", path.display(), fh);
        Ok(fh)
    }

    /// Read encrypted bytes from an open handle
    pub fn read(&self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.handles.get(fh)?.read(offset, size)
    }

    /// Close a handle
    pub fn release(&self, fh: u64) -> Result<()> {
        let session = self.handles.remove(fh)?;
        debug!("release fh {} ({})", fh, session.path().display());
        session.close()
    }

    /// Nothing is buffered for writing, so only the handle is checked
    pub fn flush(&self, fh: u64) -> Result<()> {
        self.handles.get(fh).map(|_| ())
    }

    pub fn fsync(&self, fh: u64) -> Result<()> {
        self.handles.get(fh).map(|_| ())
    }

    // Mutations

    pub fn write(&self, path: &Path, _offset: u64, _data: &[u8]) -> Result<usize> {
        self.reject("write", path)
    }

    pub fn create(&self, path: &Path, _mode: u32) -> Result<u64> {
        self.reject("create", path)
    }

    pub fn mknod(&self, path: &Path, _mode: u32, _rdev: u32) -> Result<()> {
        self.reject("mknod", path)
    }

    pub fn mkdir(&self, path: &Path, _mode: u32) -> Result<()> {
        self.reject("mkdir", path)
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        self.reject("unlink", path)
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        self.reject("rmdir", path)
    }

    pub fn symlink(&self, _target: &Path, link: &Path) -> Result<()> {
        self.reject("symlink", link)
    }

    pub fn rename(&self, from: &Path, _to: &Path) -> Result<()> {
        self.reject("rename", from)
    }

    pub fn link(&self, from: &Path, _to: &Path) -> Result<()> {
        self.reject("link", from)
    }

    pub fn truncate(&self, path: &Path, _size: u64) -> Result<()> {
        self.reject("truncate", path)
    }

    pub fn chmod(&self, path: &Path, _mode: u32) -> Result<()> {
        self.reject("chmod", path)
    }

    pub fn setxattr(&self, path: &Path, _name: &str, _value: &[u8]) -> Result<()> {
        self.reject("setxattr", path)
    }

    pub fn removexattr(&self, path: &Path, _name: &str) -> Result<()> {
        self.reject("removexattr", path)
    }

    pub fn fallocate(&self, path: &Path, _offset: u64, _length: u64) -> Result<()> {
        self.reject("fallocate", path)
    }

    pub fn chown(&self, path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> Result<()> {
        debug!("chown {} unsupported", path.display());
        Err(Error::Unsupported("chown".into()))
    }

    pub fn utimens(&self, path: &Path) -> Result<()> {
        debug!("utimens {} unsupported", path.display());
        Err(Error::Unsupported("utimens".into()))
    }

    fn reject<T>(&self, op: &str, path: &Path) -> Result<T> {
        warn!("rejected {} on {}", op, path.display());
        Err(Error::read_only(op))
    }
}

impl Drop for ReverseFs {
    fn drop(&mut self) {
        self.destroy();
    }
}
