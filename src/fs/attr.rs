//! File attributes passed through from the source tree
//!
//! CTR mode preserves length, so the plaintext size is reported unchanged.

use std::time::SystemTime;

/// File type as seen through the mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for FileKind {
    #[cfg(unix)]
    fn from(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;

        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }

    #[cfg(not(unix))]
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::RegularFile
        }
    }
}

impl FileKind {
    pub fn to_fuser_type(&self) -> fuser::FileType {
        match self {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::Symlink => fuser::FileType::Symlink,
            FileKind::BlockDevice => fuser::FileType::BlockDevice,
            FileKind::CharDevice => fuser::FileType::CharDevice,
            FileKind::Fifo => fuser::FileType::NamedPipe,
            FileKind::Socket => fuser::FileType::Socket,
        }
    }
}

/// Attributes of one source entry
#[derive(Debug, Clone)]
pub struct FileAttributes {
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl FileAttributes {
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            kind: FileKind::from(meta.file_type()),
            size: meta.len(),
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: SystemTime::UNIX_EPOCH
                + std::time::Duration::new(meta.ctime().max(0) as u64, meta.ctime_nsec() as u32),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            kind: FileKind::from(meta.file_type()),
            size: meta.len(),
            blocks: (meta.len() + 511) / 512,
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            perm: if meta.is_dir() { 0o755 } else { 0o644 },
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }

    /// Convert to fuser FileAttr for inode `ino`
    pub fn to_fuser_attr(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind: self.kind.to_fuser_type(),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_from_metadata() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("data.bin");
        std::fs::write(&file, vec![0u8; 1234]).unwrap();

        let attrs = FileAttributes::from_metadata(&std::fs::metadata(&file).unwrap());
        assert_eq!(attrs.kind, FileKind::RegularFile);
        assert_eq!(attrs.size, 1234);

        let attrs = FileAttributes::from_metadata(&std::fs::metadata(dir.path()).unwrap());
        assert_eq!(attrs.kind, FileKind::Directory);
    }

    #[test]
    fn test_to_fuser_attr() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("data.bin");
        std::fs::write(&file, b"hello").unwrap();

        let attrs = FileAttributes::from_metadata(&std::fs::metadata(&file).unwrap());
        let fattr = attrs.to_fuser_attr(42);
        assert_eq!(fattr.ino, 42);
        assert_eq!(fattr.size, 5);
        assert_eq!(fattr.kind, fuser::FileType::RegularFile);
    }
}
