//! Key hashing for the bucket table
//!
//! MurmurHash3 (x86, 32-bit) run twice with independent seeds gives the
//! 64 bits the table needs: the low `mask_bits` pick the primary bucket and
//! the next `collision_mask_bits` pick the sub-bucket.
//!
//! The table hashes through a [`KeyHasher`]. A store records the name of
//! the hasher it was built with and refuses to open under another one.

const C1: u32 = 0xcc9e2d51;
const C2: u32 = 0x1b873593;
const R1: u32 = 15;
const R2: u32 = 13;
const M: u32 = 5;
const N: u32 = 0xe6546b64;

const SEED_LOW: u32 = 0;
const SEED_HIGH: u32 = 0x9747b28c;

#[inline(always)]
pub fn murmur3_32(key: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut chunks = key.chunks_exact(4);

    for chunk in chunks.by_ref() {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(R1);
        k = k.wrapping_mul(C2);

        h ^= k;
        h = h.rotate_left(R2);
        h = h.wrapping_mul(M).wrapping_add(N);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut k = 0u32;
        for (i, &byte) in remainder.iter().enumerate() {
            k |= (byte as u32) << (i * 8);
        }

        k = k.wrapping_mul(C1);
        k = k.rotate_left(R1);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= key.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;

    h
}

/// 64-bit key hash used for bucket selection and transaction routing.
pub fn hash_key(key: &[u8]) -> u64 {
    let low = murmur3_32(key, SEED_LOW) as u64;
    let high = murmur3_32(key, SEED_HIGH) as u64;
    (high << 32) | low
}

/// Hash function behind the bucket table.
pub trait KeyHasher: Send + Sync {
    /// Name recorded in the superblock; at most 16 bytes.
    fn name(&self) -> &str;

    fn hash(&self, key: &[u8]) -> u64;
}

/// Built-in hasher over [`hash_key`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Murmur3;

impl KeyHasher for Murmur3 {
    fn name(&self) -> &str {
        "murmur3"
    }

    fn hash(&self, key: &[u8]) -> u64 {
        hash_key(key)
    }
}
