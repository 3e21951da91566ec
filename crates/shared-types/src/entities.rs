//! # Core Protocol Entities
//!
//! Views, sequence numbers, principals and content digests.
//!
//! ## Numbering
//!
//! - **View**: epoch identifying the primary, `primary = view mod N`.
//! - **Seqno**: position in the agreed total order; `0` is the initial
//!   checkpoint and is never assigned to a request batch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Epoch identifying which replica currently acts as primary.
pub type View = u64;

/// Position in the agreed total order of request batches.
pub type Seqno = u64;

/// Index of a replica in `0..N`.
pub type ReplicaId = usize;

/// Identifier of a client principal.
pub type ClientId = u64;

/// Per-client strictly increasing request timestamp.
pub type RequestId = u64;

/// Length of a [`Digest`] in bytes.
pub const DIGEST_LEN: usize = 32;

/// A party that authenticates messages: one of the `N` replicas or a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Principal {
    /// Replica with the given index.
    Replica(ReplicaId),
    /// Client with the given identifier.
    Client(ClientId),
}

impl Principal {
    /// Replica index, if this principal is a replica.
    pub fn replica(&self) -> Option<ReplicaId> {
        match self {
            Principal::Replica(id) => Some(*id),
            Principal::Client(_) => None,
        }
    }

    /// Client identifier, if this principal is a client.
    pub fn client(&self) -> Option<ClientId> {
        match self {
            Principal::Client(id) => Some(*id),
            Principal::Replica(_) => None,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Replica(id) => write!(f, "replica-{id}"),
            Principal::Client(id) => write!(f, "client-{id}"),
        }
    }
}

/// Fixed-size content hash.
///
/// Identity of a request, a pre-prepare payload, a view-change message or a
/// checkpoint snapshot. The all-zero value stands for "no digest".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// The null digest.
    pub const ZERO: Digest = Digest([0u8; DIGEST_LEN]);

    /// Wrap raw hash bytes.
    pub const fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// True for the null digest.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LEN]
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Digest {
    /// First four bytes as hex, enough to tell digests apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}
