//! SHA-256 based random generator used for key generation
//!
//! Seed material from several independent sources is folded into a
//! digest state; output blocks are `SHA-256(state || seed || counter)`.
//! Any single good source is enough to make the output unpredictable.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Number of scheduler-jitter samples per entropy pass
const JITTER_SAMPLES: usize = 64;

/// Digest-mixing pseudo-random generator
pub struct DigestRng {
    seed: [u8; 32],
    state: [u8; 32],
    counter: u64,
}

impl Drop for DigestRng {
    fn drop(&mut self) {
        self.seed.zeroize();
        self.state.zeroize();
    }
}

impl DigestRng {
    /// Create an unseeded generator. Call [`DigestRng::add_randomness`] before use.
    pub fn new() -> Self {
        DigestRng {
            seed: [0u8; 32],
            state: [0u8; 32],
            counter: 0,
        }
    }

    /// Fold arbitrary bytes into the seed
    pub fn add_seed_material(&mut self, material: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(material);
        self.seed.copy_from_slice(&hasher.finalize());
    }

    /// Gather a fresh round of entropy from every available source
    pub fn add_randomness(&mut self) -> &mut Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.add_seed_material(&now.as_nanos().to_le_bytes());

        match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => {
                self.add_seed_material(&ts.tv_sec().to_le_bytes());
                self.add_seed_material(&ts.tv_nsec().to_le_bytes());
            }
            Err(e) => debug!("monotonic clock unavailable: {}", e),
        }

        for mac in hardware_addresses() {
            self.add_seed_material(&mac);
        }

        let mut os = [0u8; 32];
        match OsRng.try_fill_bytes(&mut os) {
            Ok(()) => self.add_seed_material(&os),
            Err(e) => warn!("OS random source unavailable: {}", e),
        }
        os.zeroize();

        let mut jitter = collect_jitter(JITTER_SAMPLES);
        self.add_seed_material(&jitter);
        jitter.zeroize();

        self
    }

    /// Fill `out` with generator output
    pub fn fill_bytes(&mut self, out: &mut [u8]) {
        for chunk in out.chunks_mut(32) {
            self.step();
            chunk.copy_from_slice(&self.state[..chunk.len()]);
        }
    }

    /// Return `len` fresh bytes
    pub fn generate_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        self.fill_bytes(&mut bytes);
        bytes
    }

    fn step(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(self.state);
        hasher.update(self.seed);
        hasher.update(self.counter.to_be_bytes());
        self.state.copy_from_slice(&hasher.finalize());
        self.counter = self.counter.wrapping_add(1);
    }
}

impl Default for DigestRng {
    fn default() -> Self {
        Self::new()
    }
}

/// Link-layer addresses of the local network interfaces
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
))]
fn hardware_addresses() -> Vec<[u8; 6]> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!("could not enumerate interfaces: {}", e);
            return Vec::new();
        }
    };

    addrs
        .filter_map(|ifaddr| ifaddr.address)
        .filter_map(|addr| addr.as_link_addr().and_then(|link| link.addr()))
        .filter(|mac| mac.iter().any(|&b| b != 0))
        .collect()
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
)))]
fn hardware_addresses() -> Vec<[u8; 6]> {
    Vec::new()
}

/// Sample how far a busy counter thread gets between short sleeps
fn collect_jitter(samples: usize) -> Vec<u8> {
    let ticks = AtomicU64::new(0);
    let stop = AtomicBool::new(false);
    let mut out = Vec::with_capacity(samples);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !stop.load(Ordering::Relaxed) {
                ticks.fetch_add(1, Ordering::Relaxed);
            }
        });

        let mut last = 0u64;
        for _ in 0..samples {
            std::thread::sleep(Duration::from_micros(500));
            let now = ticks.load(Ordering::Relaxed);
            out.push((now.wrapping_sub(last) ^ (now >> 8)) as u8);
            last = now;
        }

        stop.store(true, Ordering::Relaxed);
    });

    out
}
