//! Key → partition assignment.
//!
//! Keyed records use murmur2 of the key bytes, the same hash Kafka clients
//! use by default, so keys land on the same partition no matter which
//! producer writes them. Keyless records rotate round-robin.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Kafka's murmur2 (seed 0x9747b28c).
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = SEED ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() == 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Partition for a key: positive murmur2 modulo the partition count.
pub fn partition_for_key(key: &str, partitions: i32) -> i32 {
    let positive = murmur2(key.as_bytes()) & 0x7fff_ffff;
    (positive % partitions.max(1) as u32) as i32
}

/// Stateful partitioner. Holds the round-robin cursor for keyless records.
#[derive(Debug, Default)]
pub struct Partitioner {
    next: AtomicUsize,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, key: Option<&str>, partitions: i32) -> i32 {
        match key {
            Some(key) => partition_for_key(key, partitions),
            None => {
                let n = self.next.fetch_add(1, Ordering::Relaxed);
                (n % partitions.max(1) as usize) as i32
            }
        }
    }
}
