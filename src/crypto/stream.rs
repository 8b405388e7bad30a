//! AES-256 counter-mode keystream engine
//!
//! Unlike a one-shot CTR helper, [`CtrCipher`] keeps its keystream position
//! between calls. Sequential reads continue where the last one stopped;
//! a seek is a [`CtrCipher::reset`] followed by [`CtrCipher::advance_counter`].

use super::{BLOCK_SIZE, IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes256, Block};

/// Stateful CTR keystream generator
///
/// The counter is a 128-bit big-endian integer. After each generated block
/// it equals `iv + blocks consumed`.
pub struct CtrCipher {
    cipher: Aes256,
    iv: [u8; IV_SIZE],
    counter: [u8; BLOCK_SIZE],
    keystream: [u8; BLOCK_SIZE],
    /// Next unused keystream byte; `BLOCK_SIZE` means exhausted
    cursor: usize,
}

impl CtrCipher {
    /// Key the block cipher and start the counter at `iv`
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if iv.len() != IV_SIZE {
            return Err(Error::InvalidParameters(format!(
                "IV must be {} bytes, got {}",
                IV_SIZE,
                iv.len()
            )));
        }
        if key.len() != KEY_SIZE {
            return Err(Error::InvalidParameters(format!(
                "Key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }

        let cipher = Aes256::new_from_slice(key)
            .map_err(|e| Error::InvalidParameters(format!("Invalid AES key: {}", e)))?;

        let mut iv_block = [0u8; IV_SIZE];
        iv_block.copy_from_slice(iv);

        Ok(CtrCipher {
            cipher,
            iv: iv_block,
            counter: iv_block,
            keystream: [0u8; BLOCK_SIZE],
            cursor: BLOCK_SIZE,
        })
    }

    pub fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Current counter value
    pub fn counter(&self) -> &[u8; BLOCK_SIZE] {
        &self.counter
    }

    /// Rewind to the start of the keystream. The key schedule is kept.
    pub fn reset(&mut self) {
        self.counter = self.iv;
        self.cursor = BLOCK_SIZE;
    }

    /// Add `n` to the counter, wrapping on overflow
    pub fn advance_counter(&mut self, n: u64) {
        add_to_counter(&mut self.counter, n);
    }

    /// Position the keystream at an arbitrary byte offset
    pub fn seek(&mut self, offset: u64) {
        self.reset();
        self.advance_counter(offset / BLOCK_SIZE as u64);

        let skew = (offset % BLOCK_SIZE as u64) as usize;
        if skew > 0 {
            self.refill();
            self.cursor = skew;
        }
    }

    /// XOR the keystream into `buf` in place, continuing from the current position
    pub fn transform(&mut self, buf: &mut [u8]) {
        let mut done = 0;

        while done < buf.len() {
            if self.cursor >= BLOCK_SIZE {
                self.refill();
            }

            let take = (BLOCK_SIZE - self.cursor).min(buf.len() - done);
            let stream = &self.keystream[self.cursor..self.cursor + take];
            for (b, k) in buf[done..done + take].iter_mut().zip(stream) {
                *b ^= k;
            }

            self.cursor += take;
            done += take;
        }
    }

    /// Encrypt the counter into the keystream buffer and step the counter
    fn refill(&mut self) {
        let mut block = Block::clone_from_slice(&self.counter);
        self.cipher.encrypt_block(&mut block);
        self.keystream.copy_from_slice(&block);
        self.cursor = 0;
        add_to_counter(&mut self.counter, 1);
    }
}

/// Big-endian add with carry from the least significant byte. Wraps silently.
pub fn add_to_counter(counter: &mut [u8], n: u64) {
    let mut carry = n as u128;
    for byte in counter.iter_mut().rev() {
        if carry == 0 {
            break;
        }
        let sum = *byte as u128 + carry;
        *byte = sum as u8;
        carry = sum >> 8;
    }
}
