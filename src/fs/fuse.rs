//! FUSE adapter
//!
//! Translates inode-addressed kernel requests into path operations on
//! [`ReverseFs`] and errors into errno values.

use fuser::{
    FileAttr, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use super::attr::FileKind;
use super::dispatcher::ReverseFs;
use super::inode::InodeTable;
use crate::config::Config;
use crate::error::{Error, Result};

/// Filesystem name shown in the mount table
pub const FS_NAME: &str = "rcryptfs";

/// Kernel-facing side of the mount
pub struct ReverseFuse {
    fs: Arc<ReverseFs>,
    inodes: InodeTable,
    ttl: Duration,
}

impl ReverseFuse {
    pub fn new(fs: Arc<ReverseFs>, ttl: Duration) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            ttl,
        }
    }

    fn attr_for(&self, path: &Path) -> Result<FileAttr> {
        let attrs = self.fs.getattr(path)?;
        Ok(attrs.to_fuser_attr(self.inodes.ino_for(path)))
    }

    fn entry(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = self.inodes.child_path(parent, name)?;
        self.attr_for(&path)
    }

    fn apply_setattr(
        &self,
        path: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        times_changed: bool,
    ) -> Result<FileAttr> {
        if let Some(size) = size {
            self.fs.truncate(path, size)?;
        }
        if let Some(mode) = mode {
            self.fs.chmod(path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.fs.chown(path, uid, gid)?;
        }
        if times_changed {
            self.fs.utimens(path)?;
        }
        self.attr_for(path)
    }
}

/// errno for `err`, logged at a level matching how unusual it is
fn errno(op: &str, err: &Error) -> i32 {
    match err {
        Error::NotFound(_) | Error::NotADirectory(_) => debug!("{}: {}", op, err),
        Error::ReadOnlyViolation(_) | Error::Unsupported(_) | Error::BadHandle(_) => {
            warn!("{}: {}", op, err)
        }
        _ => error!("{}: {}", op, err),
    }
    err.errno()
}

impl Filesystem for ReverseFuse {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        self.fs.init().map_err(|e| errno("init", &e))
    }

    fn destroy(&mut self) {
        info!("unmounting {}", self.fs.source_dir().display());
        self.fs.destroy();
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.entry(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("lookup", &e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        self.inodes.forget(ino);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.inodes.path_of(ino).and_then(|p| self.attr_for(&p)) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno("getattr", &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={})", ino);

        let times_changed = atime.is_some() || mtime.is_some();
        let result = self
            .inodes
            .path_of(ino)
            .and_then(|p| self.apply_setattr(&p, mode, uid, gid, size, times_changed));
        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.inodes.path_of(ino).and_then(|p| self.fs.readlink(&p)) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(errno("readlink", &e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.inodes.child_path(parent, name).and_then(|p| {
            self.fs.mknod(&p, mode, rdev)?;
            self.attr_for(&p)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("mknod", &e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.inodes.child_path(parent, name).and_then(|p| {
            self.fs.mkdir(&p, mode)?;
            self.attr_for(&p)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self
            .inodes
            .child_path(parent, name)
            .and_then(|p| self.fs.unlink(&p))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self
            .inodes
            .child_path(parent, name)
            .and_then(|p| self.fs.rmdir(&p))
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.inodes.child_path(parent, link_name).and_then(|p| {
            self.fs.symlink(target, &p)?;
            self.attr_for(&p)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.inodes.child_path(parent, name).and_then(|from| {
            let to = self.inodes.child_path(newparent, newname)?;
            self.fs.rename(&from, &to)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rename", &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.inodes.path_of(ino).and_then(|from| {
            let to = self.inodes.child_path(newparent, newname)?;
            self.fs.link(&from, &to)?;
            self.attr_for(&to)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(errno("link", &e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);

        match self.inodes.path_of(ino).and_then(|p| self.fs.open(&p, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self.fs.read(fh, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self
            .inodes
            .path_of(ino)
            .and_then(|p| self.fs.write(&p, offset.max(0) as u64, data));
        match result {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", &e)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);

        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &e)),
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let path = match self.inodes.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(errno("readdir", &e));
                return;
            }
        };

        let children = match self.fs.list_directory(&path) {
            Ok(c) => c,
            Err(e) => {
                reply.error(errno("readdir", &e));
                return;
            }
        };

        let mut entries = vec![
            (ino, FileKind::Directory, PathBuf::from(".").into_os_string()),
            (
                self.inodes.parent_ino(&path),
                FileKind::Directory,
                PathBuf::from("..").into_os_string(),
            ),
        ];
        for child in children {
            let child_ino = self.inodes.ino_for(&path.join(&child.name));
            entries.push((child_ino, child.kind, child.name));
        }

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, kind.to_fuser_type(), name);
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize,
            ),
            Err(e) => reply.error(errno("statfs", &e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self
            .inodes
            .path_of(ino)
            .and_then(|p| self.fs.setxattr(&p, &name.to_string_lossy(), value));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("setxattr", &e)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .inodes
            .path_of(ino)
            .and_then(|p| self.fs.removexattr(&p, &name.to_string_lossy()));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("removexattr", &e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        match self.inodes.path_of(ino).and_then(|p| self.fs.access(&p, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", &e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.inodes.child_path(parent, name).and_then(|p| {
            let fh = self.fs.create(&p, mode)?;
            Ok((self.attr_for(&p)?, fh))
        });
        match result {
            Ok((attr, fh)) => reply.created(&self.ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(errno("create", &e)),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        let result = self
            .inodes
            .path_of(ino)
            .and_then(|p| self.fs.fallocate(&p, offset.max(0) as u64, length.max(0) as u64));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fallocate", &e)),
        }
    }
}

/// FUSE mount options for `config`
pub fn mount_options(config: &Config) -> Vec<MountOption> {
    let mut options = vec![MountOption::RO, MountOption::FSName(FS_NAME.to_string())];

    if config.mount.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if config.mount.allow_other {
        options.push(MountOption::AllowOther);
    }
    for opt in &config.mount.options {
        options.push(MountOption::CUSTOM(opt.clone()));
    }

    options
}

/// Mount `fs` at the configured mount point and serve until unmounted
pub fn mount(fs: ReverseFs, config: &Config) -> Result<()> {
    let mount_point = &config.mount.mount_point;
    if !mount_point.is_dir() {
        return Err(Error::NotADirectory(
            mount_point.to_string_lossy().to_string(),
        ));
    }

    let options = mount_options(config);
    let ttl = Duration::from_secs(config.mount.attr_ttl_secs);
    let adapter = ReverseFuse::new(Arc::new(fs), ttl);

    info!(
        "mounting {} at {}",
        config.source_dir.display(),
        mount_point.display()
    );
    fuser::mount2(adapter, mount_point, &options).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_options() {
        let mut config = Config::new("/src", "/keys");
        config.mount.allow_other = true;
        config.mount.options = vec!["noatime".into(), "max_read=65536".into()];

        let options = mount_options(&config);
        assert!(options.contains(&MountOption::RO));
        assert!(options.contains(&MountOption::FSName(FS_NAME.to_string())));
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::AutoUnmount));
        assert!(options.contains(&MountOption::CUSTOM("noatime".into())));
        assert!(options.contains(&MountOption::CUSTOM("max_read=65536".into())));
    }

    #[test]
    fn test_default_options_are_read_only() {
        let mut config = Config::new("/src", "/keys");
        config.mount.auto_unmount = false;

        let options = mount_options(&config);
        assert_eq!(
            options,
            vec![MountOption::RO, MountOption::FSName(FS_NAME.to_string())]
        );
    }

    #[test]
    fn test_errno_passthrough() {
        assert_eq!(errno("t", &Error::read_only("write")), libc::EROFS);
        assert_eq!(errno("t", &Error::NotFound("/x".into())), libc::ENOENT);
        assert_eq!(errno("t", &Error::BadHandle(3)), libc::EBADF);
    }
}
