//! Driven ports (Outbound dependencies)
//!
//! The engine calls these synchronously from its single writer. Adapters
//! that mutate (key rotation, checkpoints) use interior mutability.

use crate::domain::{Destination, Envelope, Request};
use shared_types::{Authenticator, ClientId, Digest, Principal, ReplicaId, Seqno};
use std::time::Instant;

/// Delivery of outbound envelopes.
///
/// `AllReplicas` means every replica except the sender. Delivery is best
/// effort; the protocol retransmits through status messages.
pub trait Transport: Send + Sync {
    fn send(&self, to: Destination, envelope: Envelope);
}

/// Authentication and hashing
///
/// # Security
/// MAC vectors are only valid for the receiver whose slot they fill.
/// Messages other replicas must be able to relay (new-views, stable
/// checkpoints, key announcements) are signed instead.
pub trait CryptoService: Send + Sync {
    fn digest(&self, bytes: &[u8]) -> Digest;

    /// MAC vector over `bytes`, one slot per replica.
    fn authenticate(&self, bytes: &[u8]) -> Authenticator;

    /// Single MAC over `bytes` for one receiver.
    fn authenticate_to(&self, to: Principal, bytes: &[u8]) -> Authenticator;

    /// Check `auth` over `bytes` as sent by `sender` to this replica.
    ///
    /// Accepts either a MAC addressed here or a valid signature.
    fn verify(&self, sender: Principal, bytes: &[u8], auth: &Authenticator) -> bool;

    /// Transferable signature over `bytes`.
    fn sign(&self, bytes: &[u8]) -> Authenticator;

    fn verify_signature(&self, signer: ReplicaId, bytes: &[u8], auth: &Authenticator) -> bool;

    /// Check the client authenticator carried inside a request.
    fn verify_request(&self, request: &Request) -> bool;

    /// Start a new inbound key epoch and return it.
    fn rotate_keys(&self) -> u64;

    /// Record that `sender` now accepts keys of `epoch`.
    fn accept_key_epoch(&self, sender: ReplicaId, epoch: u64) -> bool;
}

/// Application state restored by a rollback or a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredState {
    /// Checkpoint the state corresponds to.
    pub seqno: Seqno,
    /// Protocol bytes stored with the checkpoint (the encoded reply cache).
    pub protocol_state: Vec<u8>,
}

/// Checkpointing and state transfer
///
/// The bulk movement of application state lives behind this port. The
/// engine only says when to snapshot, when to roll back, and what to fetch.
pub trait StateSync: Send + Sync {
    /// Digest of the retained checkpoint at `seqno`.
    fn digest(&self, seqno: Seqno) -> Option<Digest>;

    /// Snapshot the application at `seqno` together with `protocol_state`.
    /// Returns the digest covering both.
    fn checkpoint(&self, seqno: Seqno, protocol_state: Vec<u8>) -> Digest;

    /// Revert the application to the last checkpoint.
    fn rollback(&self) -> RestoredState;

    /// Checkpoints below `seqno` are no longer needed.
    fn discard_checkpoint(&self, seqno: Seqno, last_executed: Seqno);

    /// Begin fetching state newer than `last_executed`. With a `target`,
    /// fetch exactly that checkpoint, whose `digest` is known and which is
    /// `stable` if a quorum vouched for it.
    fn start_fetch(
        &self,
        last_executed: Seqno,
        target: Option<Seqno>,
        digest: Option<Digest>,
        stable: bool,
    );

    /// The fetched state once the transfer completes.
    fn poll_fetch(&self) -> Option<RestoredState>;

    fn in_fetch(&self) -> bool;

    /// True while the local state is being checked against digests.
    fn in_check(&self) -> bool;

    /// Keys rotated: drop unauthenticated transfer messages.
    fn mark_stale(&self);
}

/// The replicated service
///
/// `exec` must be deterministic: identical inputs produce identical
/// outputs and state at every correct replica.
pub trait Application: Send + Sync {
    fn exec(
        &self,
        command: &[u8],
        choices: &[u8],
        client: ClientId,
        read_only: bool,
        tentative: bool,
    ) -> Vec<u8>;

    /// Non-deterministic inputs (timestamps, seeds) the primary proposes
    /// for `seqno`.
    fn non_det_choices(&self, seqno: Seqno) -> Vec<u8>;

    /// Backups accept a pre-prepare only if its choices pass this check.
    fn check_non_det(&self, choices: &[u8]) -> bool;
}

/// Time source for protocol timers
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Default clock using the monotonic system time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
