//! Crypto error types.

use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Invalid public key
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// A principal outside the configured replica set was referenced
    #[error("Unknown replica {replica} (replica count {replica_count})")]
    UnknownReplica {
        /// Referenced replica index
        replica: usize,
        /// Configured number of replicas
        replica_count: usize,
    },
}
