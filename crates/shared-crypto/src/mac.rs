//! # Session MACs
//!
//! BLAKE3 in keyed mode, truncated to [`MAC_LEN`] bytes. One MAC per
//! receiving replica forms an authenticator vector.

use crate::hashing::blake3_keyed_hash;
use shared_types::{Mac, MAC_LEN};

/// Compute a truncated MAC over `data`.
pub fn compute_mac(key: &[u8; 32], data: &[u8]) -> Mac {
    let full = blake3_keyed_hash(key, data);
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&full[..MAC_LEN]);
    mac
}

/// Verify a truncated MAC in constant time.
pub fn verify_mac(key: &[u8; 32], data: &[u8], mac: &Mac) -> bool {
    let expected = compute_mac(key, data);
    expected
        .iter()
        .zip(mac.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
