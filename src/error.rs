//! Error types for rcryptfs
//!
//! A single error enum covers every layer. The FUSE adapter turns each
//! variant into an errno with [`Error::errno`].

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Path does not resolve to anything under the source root
    #[error("Not found: {0}")]
    NotFound(String),

    /// Directory operation on something that is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Any attempt to modify the source tree
    #[error("Read-only filesystem: {0} rejected")]
    ReadOnlyViolation(String),

    /// Operation deliberately not implemented
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Unknown or already released file handle
    #[error("Bad file handle: {0}")]
    BadHandle(u64),

    /// Storage read/seek failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing, malformed or wrong-length key material
    #[error("Initialization failed: {0}")]
    InitializationFailure(String),

    /// Key or IV of the wrong size handed to the cipher engine
    #[error("Invalid cipher parameters: {0}")]
    InvalidParameters(String),

    /// Config file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config values failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// errno reported to the kernel for this error
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::ReadOnlyViolation(_) => libc::EROFS,
            Error::Unsupported(_) => libc::ENOTSUP,
            Error::BadHandle(_) => libc::EBADF,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Map an io error on `path` to `NotFound` when it is one
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
            _ => Error::Io(err),
        }
    }

    pub fn read_only(op: &str) -> Self {
        Error::ReadOnlyViolation(op.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound("/x".into()).errno(), libc::ENOENT);
        assert_eq!(Error::NotADirectory("/x".into()).errno(), libc::ENOTDIR);
        assert_eq!(Error::read_only("write").errno(), libc::EROFS);
        assert_eq!(Error::Unsupported("chown".into()).errno(), libc::ENOTSUP);
        assert_eq!(Error::BadHandle(7).errno(), libc::EBADF);
        assert_eq!(
            Error::InitializationFailure("bad key".into()).errno(),
            libc::EIO
        );
    }

    #[test]
    fn test_io_errno_passthrough() {
        let err = Error::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.errno(), libc::EACCES);

        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_read_only_distinct_from_not_found() {
        let ro = Error::read_only("unlink");
        let nf = Error::from_io(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/gone",
        );
        assert_ne!(ro.errno(), nf.errno());
        assert!(matches!(nf, Error::NotFound(ref p) if p == "/gone"));
    }
}
