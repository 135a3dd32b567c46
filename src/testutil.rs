use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::config::ChunkerConfig;
use crate::crypto::{Crypto, StaticKeyProvider};
use crate::snapshot::Clock;

pub const DEVICE_ID: &str = "test-device";

/// Chunk sizes small enough to get many chunks out of test inputs.
pub const SMALL_CHUNKS: ChunkerConfig = ChunkerConfig {
    min_size: 1024,
    avg_size: 4096,
    max_size: 16384,
};

pub fn keys() -> StaticKeyProvider {
    StaticKeyProvider::new([23; 32], DEVICE_ID)
}

pub fn crypto() -> Crypto {
    Crypto::new(&keys())
}

pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// A [`Clock`] that advances by one second every time it is read.
#[derive(Debug)]
pub struct TickingClock(AtomicU64);

impl TickingClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }
}

impl Clock for TickingClock {
    fn now_millis(&self) -> u64 {
        self.0.fetch_add(1000, Ordering::SeqCst)
    }
}
