//! # BLAKE3 Hashing
//!
//! Content digests for requests, pre-prepare batches and checkpoints.

use blake3::Hasher;
use shared_types::Digest;

/// BLAKE3 hash output (256-bit).
pub type Hash = [u8; 32];

/// Stateful BLAKE3 hasher.
pub struct Blake3Hasher {
    inner: Hasher,
}

impl Blake3Hasher {
    /// Create new hasher.
    pub fn new() -> Self {
        Self {
            inner: Hasher::new(),
        }
    }

    /// Create keyed hasher (for MAC).
    pub fn new_keyed(key: &[u8; 32]) -> Self {
        Self {
            inner: Hasher::new_keyed(key),
        }
    }

    /// Update with data.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Update with a length-prefixed field, so that adjacent fields cannot
    /// be re-split into a colliding input.
    pub fn update_field(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(&(data.len() as u64).to_le_bytes());
        self.inner.update(data);
        self
    }

    /// Finalize and return hash.
    pub fn finalize(&self) -> Hash {
        *self.inner.finalize().as_bytes()
    }

    /// Finalize into a protocol digest.
    pub fn finalize_digest(&self) -> Digest {
        Digest::new(self.finalize())
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash data with BLAKE3 (one-shot).
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Hash data into a protocol digest.
pub fn blake3_digest(data: &[u8]) -> Digest {
    Digest::new(blake3_hash(data))
}

/// Hash multiple inputs as length-prefixed fields.
pub fn blake3_hash_many(inputs: &[&[u8]]) -> Hash {
    let mut hasher = Blake3Hasher::new();
    for input in inputs {
        hasher.update_field(input);
    }
    hasher.finalize()
}

/// Keyed hash.
pub fn blake3_keyed_hash(key: &[u8; 32], data: &[u8]) -> Hash {
    *blake3::keyed_hash(key, data).as_bytes()
}

/// Derive key from context and input key material.
pub fn blake3_derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, key_material)
}
