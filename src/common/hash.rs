//! Hashing utilities for kvmesh
//!
//! - BLAKE3-derived 64-bit hashes for ring placement
//! - Stable Raft ids derived from string node ids

/// 64-bit hash of arbitrary bytes: first 8 bytes of BLAKE3, little-endian.
pub fn hash64(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix)
}

/// Pluggable hash function for the ring.
pub trait RingHasher: Send + Sync {
    fn sum64(&self, data: &[u8]) -> u64;
}

/// Default ring hasher backed by BLAKE3
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Hasher;

impl RingHasher for Blake3Hasher {
    fn sum64(&self, data: &[u8]) -> u64 {
        hash64(data)
    }
}

/// Raft identifies peers by a non-zero `u64`; nodes are named by strings.
pub fn raft_id(node_id: &str) -> u64 {
    match hash64(node_id.as_bytes()) {
        0 => 1,
        id => id,
    }
}
