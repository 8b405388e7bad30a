//! rcryptfs - Reverse-encrypting FUSE filesystem
//!
//! Exposes a plaintext directory through a read-only mount whose file
//! contents are AES-256-CTR ciphertext, so encrypted backups can be taken
//! without storing an encrypted copy.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{CtrCipher, KeyManager};
    pub use crate::error::{Error, Result};
    pub use crate::fs::ReverseFs;
}
