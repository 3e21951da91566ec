//! # Replica Signatures
//!
//! MACs convince only the receiver. Messages that get relayed (new-view,
//! stable checkpoints, key announcements) must convince a third replica, so
//! they carry an Ed25519 signature instead.
//!
//! Every replica's key pair is derived from the deployment secret and its
//! index, which gives each replica the full table of public keys without a
//! separate distribution step.

use crate::hashing::blake3_derive_key;
use crate::CryptoError;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use zeroize::Zeroize;

const SIGNING_CONTEXT: &str = "pbft-signing-key v1";

/// Verifying half of a replica's key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ed25519PublicKey(VerifyingKey);

impl Ed25519PublicKey {
    /// Parse a compressed point; fails if it is not on the curve.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Compressed encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Strict verification: rejects malleable and small-order signatures.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CryptoError> {
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0
            .verify_strict(message, &signature)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

/// Detached 64-byte signature as carried in an authenticator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ed25519Signature([u8; 64]);

impl Ed25519Signature {
    /// Wrap raw bytes; validity is only checked by `verify`.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

/// A replica's signing key. The secret is wiped when dropped.
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    /// Key pair for `label` (normally the replica's index) under `master`.
    pub fn derive(master: &[u8; 32], label: &[u8]) -> Self {
        let mut material = Vec::with_capacity(master.len() + label.len());
        material.extend_from_slice(master);
        material.extend_from_slice(label);
        let mut seed = blake3_derive_key(SIGNING_CONTEXT, &material);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        material.zeroize();
        Self { signing_key }
    }

    /// The matching verifying key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.signing_key.verifying_key())
    }

    /// Ed25519 nonces are derived from the key and message, so equal
    /// inputs give equal signatures.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.signing_key.sign(message).to_bytes())
    }
}

/// Public keys of replicas `0..replica_count`, indexed by replica.
pub fn derive_public_keys(
    master: &[u8; 32],
    replica_count: usize,
    label: impl Fn(usize) -> Vec<u8>,
) -> Vec<Ed25519PublicKey> {
    (0..replica_count)
        .map(|r| Ed25519KeyPair::derive(master, &label(r)).public_key())
        .collect()
}
