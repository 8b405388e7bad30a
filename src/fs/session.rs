//! Open-file sessions and the encrypted read path
//!
//! A session owns the source file and one cipher context per reading
//! thread. Reads take one of two paths:
//!
//! * hot: the request starts exactly where the previous read ended and the
//!   calling thread's keystream is already positioned there, so bytes are
//!   read and transformed with no counter arithmetic
//! * cold: the offset is aligned down to a cipher block, the counter is
//!   recomputed from the IV, and the `skew` leading bytes are dropped
//!
//! The file seek+read pair runs under the file lock; the transform runs on
//! thread-private state with no lock held.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

use crate::crypto::{CtrCipher, KeyManager, BLOCK_SIZE};
use crate::error::{Error, Result};

/// Cipher context and scratch space private to one reading thread
pub struct ThreadCipher {
    cipher: CtrCipher,
    /// Byte offset the keystream is positioned at
    position: u64,
    scratch: Vec<u8>,
}

impl ThreadCipher {
    fn new(cipher: CtrCipher) -> Self {
        Self {
            cipher,
            position: 0,
            scratch: Vec::new(),
        }
    }

    fn scratch(&mut self, len: usize) -> &mut [u8] {
        if self.scratch.len() < len {
            self.scratch.resize(len, 0);
        }
        &mut self.scratch[..len]
    }

    fn trim_scratch(&mut self, retain: usize) {
        if self.scratch.len() > retain {
            self.scratch.truncate(retain);
            self.scratch.shrink_to_fit();
        }
    }
}

/// One open file
pub struct FileSession {
    fh: u64,
    path: PathBuf,
    file: Mutex<Option<File>>,
    keys: Arc<KeyManager>,
    threads: Mutex<HashMap<ThreadId, ThreadCipher>>,
    closed: AtomicBool,
    /// Offset at which the most recent read ended
    expected_offset: AtomicU64,
    scratch_retain: usize,
}

impl FileSession {
    pub fn new(
        fh: u64,
        path: impl Into<PathBuf>,
        file: File,
        keys: Arc<KeyManager>,
        scratch_retain: usize,
    ) -> Self {
        Self {
            fh,
            path: path.into(),
            file: Mutex::new(Some(file)),
            keys,
            threads: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            expected_offset: AtomicU64::new(0),
            scratch_retain,
        }
    }

    pub fn fh(&self) -> u64 {
        self.fh
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset at which the next hot read is expected
    pub fn expected_offset(&self) -> u64 {
        self.expected_offset.load(Ordering::Acquire)
    }

    /// Number of threads holding a cipher context
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Scratch bytes retained by `thread` between reads
    pub fn scratch_capacity(&self, thread: ThreadId) -> usize {
        self.threads
            .lock()
            .get(&thread)
            .map(|t| t.scratch.len())
            .unwrap_or(0)
    }

    /// Take the calling thread's cipher context, creating it on first use
    ///
    /// The context is removed from the session while the caller holds it and
    /// must be handed back with [`FileSession::return_cipher`].
    pub fn cipher_for(&self, thread: ThreadId) -> Result<ThreadCipher> {
        if let Some(state) = self.threads.lock().remove(&thread) {
            return Ok(state);
        }
        trace!("fh {}: new cipher context for {:?}", self.fh, thread);
        Ok(ThreadCipher::new(self.keys.new_cipher()?))
    }

    fn return_cipher(&self, thread: ThreadId, mut state: ThreadCipher) {
        state.trim_scratch(self.scratch_retain);
        // close() sets the flag before clearing under this lock
        let mut threads = self.threads.lock();
        if !self.closed.load(Ordering::Acquire) {
            threads.insert(thread, state);
        }
    }

    /// Read `size` encrypted bytes starting at `offset`
    ///
    /// Returns fewer bytes only at end of file, and none at or past it.
    pub fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let thread = thread::current().id();
        let mut state = self.cipher_for(thread)?;
        let result = self.read_with(&mut state, offset, size);
        self.return_cipher(thread, state);
        result
    }

    /// Read with an explicit cold start regardless of stream position
    pub fn read_cold(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let thread = thread::current().id();
        let mut state = self.cipher_for(thread)?;
        let result = self.read_cold_with(&mut state, offset, size);
        self.return_cipher(thread, state);
        result
    }

    fn read_with(&self, state: &mut ThreadCipher, offset: u64, size: usize) -> Result<Vec<u8>> {
        if offset == self.expected_offset() && state.position == offset {
            self.read_hot_with(state, offset, size)
        } else {
            self.read_cold_with(state, offset, size)
        }
    }

    fn read_hot_with(&self, state: &mut ThreadCipher, offset: u64, size: usize) -> Result<Vec<u8>> {
        trace!("fh {}: hot read offset={} size={}", self.fh, offset, size);

        let n = self.read_at(offset, state.scratch(size))?;
        let buf = &mut state.scratch[..n];
        state.cipher.transform(buf);
        state.position = offset + n as u64;

        if n > 0 {
            self.expected_offset.store(offset + n as u64, Ordering::Release);
        }
        Ok(buf.to_vec())
    }

    fn read_cold_with(&self, state: &mut ThreadCipher, offset: u64, size: usize) -> Result<Vec<u8>> {
        let block = BLOCK_SIZE as u64;
        let skew = (offset % block) as usize;
        let aligned = offset - skew as u64;
        trace!(
            "fh {}: cold read offset={} size={} aligned={} skew={}",
            self.fh,
            offset,
            size,
            aligned,
            skew
        );

        let m = self.read_at(aligned, state.scratch(size + skew))?;

        state.cipher.reset();
        state.cipher.advance_counter(aligned / block);
        state.cipher.transform(&mut state.scratch[..m]);
        state.position = aligned + m as u64;

        if m <= skew {
            return Ok(Vec::new());
        }

        self.expected_offset
            .store(offset + (m - skew) as u64, Ordering::Release);
        Ok(state.scratch[skew..m].to_vec())
    }

    /// Seek and fill `buf` from the source file, short only at end of file
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(Error::BadHandle(self.fh))?;

        file.seek(SeekFrom::Start(offset))?;

        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(total)
    }

    /// Close the source file and drop every cipher context
    pub fn close(&self) -> Result<()> {
        let file = self.file.lock().take();
        self.closed.store(true, Ordering::Release);
        self.threads.lock().clear();

        let file = file.ok_or(Error::BadHandle(self.fh))?;
        debug!("fh {}: closing {}", self.fh, self.path.display());
        close_file(file)
    }
}

#[cfg(unix)]
fn close_file(file: File) -> Result<()> {
    use std::os::unix::io::IntoRawFd;
    nix::unistd::close(file.into_raw_fd()).map_err(|e| Error::Io(std::io::Error::from(e)))
}

#[cfg(not(unix))]
fn close_file(file: File) -> Result<()> {
    drop(file);
    Ok(())
}
