//! Read-only FUSE filesystem
//!
//! Mirrors a plaintext source tree, encrypting file contents on the fly
//! with AES-256-CTR. Metadata passes through unchanged.

mod attr;
mod dispatcher;
mod fuse;
mod handle;
mod inode;
mod lower;
mod session;

pub use attr::{FileAttributes, FileKind};
pub use dispatcher::{DirEntry, ReverseFs};
pub use fuse::{mount, mount_options, ReverseFuse, FS_NAME};
pub use handle::HandleTable;
pub use inode::{InodeTable, ROOT_INO};
pub use lower::{FsStats, LowerLayer};
pub use session::{FileSession, ThreadCipher};
