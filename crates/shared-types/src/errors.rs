//! # Error Types
//!
//! Errors raised at the wire boundary, shared by codec users.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire envelopes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Encode failed: {0}")]
    Encode(String),

    /// Bytes did not decode into a known message.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Envelope version not supported.
    #[error("Unsupported version: received {received}, supported {supported}")]
    UnsupportedVersion { received: u16, supported: u16 },

    /// Encoded message exceeds the configured maximum.
    #[error("Message too large: {size} bytes exceeds {max}")]
    TooLarge { size: usize, max: usize },
}
