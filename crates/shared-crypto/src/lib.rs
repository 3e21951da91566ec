//! # Shared Crypto
//!
//! Cryptographic primitives consumed by the agreement engine through its
//! crypto port.
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `hashing` | BLAKE3 | Request, batch and checkpoint digests |
//! | `mac` | BLAKE3 keyed, truncated to 128 bits | Per-receiver authenticators |
//! | `keyring` | BLAKE3 key derivation | Session keys with epoch rotation |
//! | `signatures` | Ed25519 | Transferable proofs (new-view, stable checkpoints) |
//!
//! ## Security Properties
//!
//! - **Ed25519**: Deterministic nonces, no RNG dependency
//! - **BLAKE3**: SIMD-accelerated keyed mode doubles as a MAC
//! - **Session keys**: derived per ordered pair and epoch, zeroized on drop

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod errors;
pub mod hashing;
pub mod keyring;
pub mod mac;
pub mod signatures;

// Re-exports
pub use errors::CryptoError;
pub use hashing::{blake3_digest, blake3_hash, blake3_hash_many, Blake3Hasher};
pub use keyring::SessionKeys;
pub use mac::{compute_mac, verify_mac};
pub use signatures::{derive_public_keys, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
