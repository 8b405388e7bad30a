//! Cryptographic primitives for rcryptfs
//!
//! Key hierarchy is flat: one AES-256 key and one 128-bit IV per mount.
//! ```text
//! key file (key=<base58>, iv=<base58>)
//!   └── CtrCipher per reading thread (AES-256, counter = IV + block index)
//! ```

mod keys;
mod rng;
mod stream;

pub use keys::{KeyFile, KeyManager};
pub use rng::DigestRng;
pub use stream::{add_to_counter, CtrCipher};

/// Size of the AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the IV, equal to the AES block size
pub const IV_SIZE: usize = 16;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;
