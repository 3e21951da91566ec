//! Agreement error types.
//!
//! Protocol-level rejections (unauthenticated, out-of-window or conflicting
//! messages) are not errors: handlers drop them and the sender retransmits.
//! The variants here cover the API surface only.

use shared_types::{CodecError, Principal, Seqno, View};
use thiserror::Error;

/// Errors surfaced by the agreement crate's public API.
#[derive(Debug, Error)]
pub enum AgreementError {
    /// Configuration rejected by validation
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Envelope bytes could not be decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Envelope sender is outside the configured principal set
    #[error("Unknown principal: {0}")]
    UnknownPrincipal(Principal),

    /// Message sender field disagrees with the envelope sender
    #[error("Sender mismatch: envelope from {envelope}, message claims {claimed}")]
    SenderMismatch { envelope: Principal, claimed: Principal },

    /// Persisted replica state could not be decoded
    #[error("Persisted state unreadable: {0}")]
    PersistenceDecode(String),

    /// Persisted replica state violates a marker invariant
    #[error("Persisted state invalid at view {view}: {reason}")]
    PersistenceInvalid { view: View, reason: String },

    /// Restart requested with a log window that does not fit the configuration
    #[error("Persisted window starting at {last_stable} does not fit max_out {max_out}")]
    WindowMismatch { last_stable: Seqno, max_out: u64 },

    /// The replica task is no longer running
    #[error("Replica service stopped")]
    ServiceStopped,
}

/// Result type for agreement operations
pub type AgreementResult<T> = Result<T, AgreementError>;
