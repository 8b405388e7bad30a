//! Source tree pass-through
//!
//! Read-only access to the plaintext directory the mount encrypts.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::fs::{self, File, Metadata};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::attr::FileKind;

/// Directory entry from the source tree
#[derive(Debug, Clone)]
pub struct LowerDirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

/// Filesystem statistics of the source tree
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Pass-through interface to the plaintext tree
///
/// Symlinks are followed as long as their target stays inside the root.
/// A link pointing out of the tree, or at nothing, does not exist.
pub struct LowerLayer {
    /// Root path of the source tree
    root: PathBuf,
    /// `root` with every link resolved
    canonical_root: PathBuf,
}

impl LowerLayer {
    pub fn new(root: PathBuf) -> Result<Self> {
        let meta = fs::metadata(&root)
            .map_err(|e| Error::from_io(e, &root.to_string_lossy()))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(root.to_string_lossy().to_string()));
        }
        let canonical_root = fs::canonicalize(&root)?;
        Ok(Self {
            root,
            canonical_root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a virtual path to an absolute source path
    ///
    /// `..` may not climb above the root.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        let mut depth = 0usize;

        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => {
                    resolved.push(name);
                    depth += 1;
                }
                Component::ParentDir if depth > 0 => {
                    resolved.pop();
                    depth -= 1;
                }
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(Error::NotFound(path.to_string_lossy().to_string()));
                }
            }
        }

        Ok(resolved)
    }

    /// Source path of `path` with all links resolved, kept inside the root
    fn confine(&self, path: &Path) -> Result<PathBuf> {
        self.confine_source(&self.resolve(path)?, path)
    }

    fn confine_source(&self, source: &Path, path: &Path) -> Result<PathBuf> {
        let canonical =
            fs::canonicalize(source).map_err(|e| Error::from_io(e, &path.to_string_lossy()))?;
        if !canonical.starts_with(&self.canonical_root) {
            debug!("{} leaves the source tree", path.display());
            return Err(Error::NotFound(path.to_string_lossy().to_string()));
        }
        Ok(canonical)
    }

    /// Metadata of whatever `path` refers to
    pub fn metadata(&self, path: &Path) -> Result<Metadata> {
        let source = self.confine(path)?;
        fs::metadata(&source).map_err(|e| Error::from_io(e, &path.to_string_lossy()))
    }

    /// Open a regular file for reading
    pub fn open_file(&self, path: &Path) -> Result<File> {
        let source = self.confine(path)?;
        let meta = fs::metadata(&source).map_err(|e| Error::from_io(e, &path.to_string_lossy()))?;
        if !meta.is_file() {
            return Err(Error::NotFound(path.to_string_lossy().to_string()));
        }
        File::open(&source).map_err(|e| Error::from_io(e, &path.to_string_lossy()))
    }

    /// Read directory entries, sorted by name
    pub fn readdir(&self, path: &Path) -> Result<Vec<LowerDirEntry>> {
        let meta = self.metadata(path)?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(path.to_string_lossy().to_string()));
        }

        let source = self.confine(path)?;
        let mut entries = Vec::new();

        for entry in fs::read_dir(&source)? {
            let entry = entry?;
            let mut file_type = entry.file_type()?;

            if file_type.is_symlink() {
                let link = path.join(entry.file_name());
                match self
                    .confine_source(&entry.path(), &link)
                    .and_then(|target| fs::metadata(target).map_err(Error::from))
                {
                    Ok(meta) => file_type = meta.file_type(),
                    Err(_) => continue,
                }
            }

            entries.push(LowerDirEntry {
                name: entry.file_name(),
                kind: FileKind::from(file_type),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Statistics of the filesystem holding the source tree
    pub fn statfs(&self) -> Result<FsStats> {
        let st = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;

        Ok(FsStats {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_lower_layer() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test.txt"), b"hello world").unwrap();

        let lower = LowerLayer::new(dir.path().to_path_buf()).unwrap();

        assert!(lower.metadata(Path::new("/test.txt")).unwrap().is_file());
        assert!(matches!(
            lower.metadata(Path::new("/nonexistent.txt")),
            Err(Error::NotFound(_))
        ));

        let mut content = Vec::new();
        lower
            .open_file(Path::new("test.txt"))
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"hello world");
    }

    #[test]
    fn test_readdir_sorted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file2.txt"), b"2").unwrap();
        fs::write(dir.path().join("file1.txt"), b"1").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let lower = LowerLayer::new(dir.path().to_path_buf()).unwrap();

        let entries = lower.readdir(Path::new("/")).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["file1.txt", "file2.txt", "subdir"]);
        assert_eq!(entries[2].kind, FileKind::Directory);
    }

    #[test]
    fn test_readdir_on_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file.txt"), b"1").unwrap();
        let lower = LowerLayer::new(dir.path().to_path_buf()).unwrap();

        assert!(matches!(
            lower.readdir(Path::new("/file.txt")),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_resolve_stays_under_root() {
        let dir = tempdir().unwrap();
        let lower = LowerLayer::new(dir.path().to_path_buf()).unwrap();

        assert_eq!(
            lower.resolve(Path::new("/a/b/../c")).unwrap(),
            dir.path().join("a").join("c")
        );
        assert!(matches!(
            lower.resolve(Path::new("/../etc/passwd")),
            Err(Error::NotFound(_))
        ));
        assert_eq!(lower.resolve(Path::new("/")).unwrap(), dir.path());
    }

    #[test]
    fn test_open_directory_is_not_found() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        let lower = LowerLayer::new(dir.path().to_path_buf()).unwrap();

        assert!(matches!(
            lower.open_file(Path::new("/subdir")),
            Err(Error::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_inside_root_are_followed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("target.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink("../target.txt", dir.path().join("sub/up")).unwrap();
        std::os::unix::fs::symlink("sub", dir.path().join("sublink")).unwrap();
        let lower = LowerLayer::new(dir.path().to_path_buf()).unwrap();

        assert!(lower.metadata(Path::new("/link")).unwrap().is_file());
        assert!(lower.metadata(Path::new("/sublink")).unwrap().is_dir());

        let mut content = Vec::new();
        lower
            .open_file(Path::new("/sub/up"))
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"x");

        let entries = lower.readdir(Path::new("/")).unwrap();
        let kinds: Vec<_> = entries
            .iter()
            .map(|e| (e.name.to_string_lossy().to_string(), e.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("link".to_string(), FileKind::RegularFile),
                ("sub".to_string(), FileKind::Directory),
                ("sublink".to_string(), FileKind::Directory),
                ("target.txt".to_string(), FileKind::RegularFile),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_leaving_root_are_hidden() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(dir.path().join("secret.txt"), b"plaintext").unwrap();
        fs::write(root.join("plain.txt"), b"1").unwrap();

        std::os::unix::fs::symlink(dir.path().join("secret.txt"), root.join("absolute")).unwrap();
        std::os::unix::fs::symlink("../secret.txt", root.join("relative")).unwrap();
        std::os::unix::fs::symlink(dir.path(), root.join("outdir")).unwrap();
        std::os::unix::fs::symlink("missing", root.join("dangling")).unwrap();
        let lower = LowerLayer::new(root).unwrap();

        for name in ["/absolute", "/relative", "/outdir", "/dangling", "/outdir/secret.txt"] {
            assert!(
                matches!(lower.metadata(Path::new(name)), Err(Error::NotFound(_))),
                "{name}"
            );
            assert!(
                matches!(lower.open_file(Path::new(name)), Err(Error::NotFound(_))),
                "{name}"
            );
        }
        assert!(matches!(
            lower.readdir(Path::new("/outdir")),
            Err(Error::NotFound(_))
        ));

        let names: Vec<_> = lower
            .readdir(Path::new("/"))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["plain.txt"]);
    }

    #[test]
    fn test_statfs() {
        let dir = tempdir().unwrap();
        let lower = LowerLayer::new(dir.path().to_path_buf()).unwrap();
        let stats = lower.statfs().unwrap();
        assert!(stats.bsize > 0);
    }

    #[test]
    fn test_missing_root() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            LowerLayer::new(dir.path().join("missing")),
            Err(Error::NotFound(_))
        ));
    }
}
