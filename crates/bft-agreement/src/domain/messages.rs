//! Protocol messages.
//!
//! Ordering messages other than [`PrePrepare`] carry only digests. A
//! pre-prepare keeps its payload in a shared [`Batch`] so that moving it to a
//! new view, logging it for a view change, or executing it never copies the
//! requests.

use super::certificate::Vote;
use super::request::Request;
use serde::{Deserialize, Serialize};
use shared_crypto::Blake3Hasher;
use shared_types::{Digest, ReplicaId, Seqno, View};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Out-of-band requests a single pre-prepare may reference.
pub const MAX_BIG_REQUESTS: usize = 64;

// =============================================================================
// PRE-PREPARE
// =============================================================================

/// The ordered payload of a pre-prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    requests: Vec<Request>,
    big_requests: Vec<Digest>,
    choices: Vec<u8>,
    digest: Digest,
}

impl Batch {
    /// Batch of inlined requests, out-of-band request digests and the
    /// application's non-deterministic choices.
    pub fn new(requests: Vec<Request>, big_requests: Vec<Digest>, choices: Vec<u8>) -> Self {
        let digest = Self::compute_digest(&requests, &big_requests, &choices);
        Self {
            requests,
            big_requests,
            choices,
            digest,
        }
    }

    /// The null batch chosen for sequence numbers nobody proved.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new())
    }

    fn compute_digest(requests: &[Request], big_requests: &[Digest], choices: &[u8]) -> Digest {
        let mut hasher = Blake3Hasher::new();
        hasher.update_field(b"batch");
        hasher.update(&(requests.len() as u64).to_le_bytes());
        for request in requests {
            hasher.update(request.digest().as_bytes());
        }
        hasher.update(&(big_requests.len() as u64).to_le_bytes());
        for digest in big_requests {
            hasher.update(digest.as_bytes());
        }
        hasher.update_field(choices);
        hasher.finalize_digest()
    }

    /// True if the carried digest matches the content.
    ///
    /// Decoded batches must pass this before their digest is trusted.
    pub fn check_digest(&self) -> bool {
        self.big_requests.len() <= MAX_BIG_REQUESTS
            && Self::compute_digest(&self.requests, &self.big_requests, &self.choices)
                == self.digest
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn big_requests(&self) -> &[Digest] {
        &self.big_requests
    }

    pub fn choices(&self) -> &[u8] {
        &self.choices
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.big_requests.is_empty()
    }
}

/// Primary's proposal binding a batch to `(view, seqno)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: View,
    pub seqno: Seqno,
    pub batch: Arc<Batch>,
}

impl PrePrepare {
    pub fn new(view: View, seqno: Seqno, batch: Batch) -> Self {
        Self {
            view,
            seqno,
            batch: Arc::new(batch),
        }
    }

    /// Pre-prepare for the null request.
    pub fn null(view: View, seqno: Seqno) -> Self {
        Self::new(view, seqno, Batch::empty())
    }

    /// The same batch re-proposed in `view`. The payload is shared.
    pub fn with_view(&self, view: View) -> Self {
        Self {
            view,
            seqno: self.seqno,
            batch: Arc::clone(&self.batch),
        }
    }

    /// Digest of the batch; independent of view and sequence number.
    pub fn digest(&self) -> Digest {
        self.batch.digest()
    }

    pub fn requests(&self) -> &[Request] {
        self.batch.requests()
    }

    pub fn big_requests(&self) -> &[Digest] {
        self.batch.big_requests()
    }

    pub fn choices(&self) -> &[u8] {
        self.batch.choices()
    }
}

// =============================================================================
// PREPARE / COMMIT / CHECKPOINT
// =============================================================================

/// Backup's agreement with a pre-prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: View,
    pub seqno: Seqno,
    pub digest: Digest,
    pub sender: ReplicaId,
    /// Sent to prove a request during a view change rather than to prepare.
    pub proof: bool,
}

impl Prepare {
    pub fn new(view: View, seqno: Seqno, digest: Digest, sender: ReplicaId) -> Self {
        Self {
            view,
            seqno,
            digest,
            sender,
            proof: false,
        }
    }
}

impl Vote for Prepare {
    fn voter(&self) -> ReplicaId {
        self.sender
    }

    fn same_value(&self, other: &Self) -> bool {
        self.view == other.view && self.digest == other.digest
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: View,
    pub seqno: Seqno,
    pub sender: ReplicaId,
}

impl Vote for Commit {
    fn voter(&self) -> ReplicaId {
        self.sender
    }

    fn same_value(&self, other: &Self) -> bool {
        self.view == other.view
    }
}

/// Digest of the replicated state after executing `seqno`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seqno: Seqno,
    pub digest: Digest,
    /// Set once the sender holds a complete certificate; stable checkpoints
    /// are signed so they can be relayed.
    pub stable: bool,
    pub sender: ReplicaId,
}

impl Vote for Checkpoint {
    fn voter(&self) -> ReplicaId {
        self.sender
    }

    fn same_value(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

// =============================================================================
// VIEW CHANGE
// =============================================================================

/// What a replica knows about one sequence number when leaving a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeEntry {
    pub seqno: Seqno,
    /// Latest view in which the replica pre-prepared (or prepared) `digest`.
    pub view: View,
    /// For prepared entries, the last view the replica sent a prepare for
    /// `digest`; otherwise the view of the value it held before.
    pub last_view: Option<View>,
    pub digest: Digest,
    pub prepared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub view: View,
    pub last_stable: Seqno,
    /// Checkpoint digests from `last_stable` up to the sender's last executed.
    pub checkpoints: Vec<(Seqno, Digest)>,
    /// Entries in ascending sequence number order. Null entries are omitted.
    pub requests: Vec<ViewChangeEntry>,
    pub sender: ReplicaId,
}

impl ViewChange {
    pub fn new(view: View, last_stable: Seqno, sender: ReplicaId) -> Self {
        Self {
            view,
            last_stable,
            checkpoints: Vec::new(),
            requests: Vec::new(),
            sender,
        }
    }

    /// Digest of the whole message, referenced by acks and new-views.
    pub fn digest(&self) -> Digest {
        let mut hasher = Blake3Hasher::new();
        hasher
            .update_field(b"view-change")
            .update(&self.view.to_le_bytes())
            .update(&self.last_stable.to_le_bytes())
            .update(&(self.sender as u64).to_le_bytes())
            .update(&(self.checkpoints.len() as u64).to_le_bytes());
        for (seqno, digest) in &self.checkpoints {
            hasher.update(&seqno.to_le_bytes()).update(digest.as_bytes());
        }
        hasher.update(&(self.requests.len() as u64).to_le_bytes());
        for entry in &self.requests {
            hasher
                .update(&entry.seqno.to_le_bytes())
                .update(&entry.view.to_le_bytes())
                .update(&entry.last_view.map_or(u64::MAX, |v| v).to_le_bytes())
                .update(&[u8::from(entry.last_view.is_some()), u8::from(entry.prepared)])
                .update(entry.digest.as_bytes());
        }
        hasher.finalize_digest()
    }

    /// Checkpoint digest reported for `seqno`.
    pub fn ckpt(&self, seqno: Seqno) -> Option<Digest> {
        self.checkpoints
            .iter()
            .find(|(n, _)| *n == seqno)
            .map(|(_, d)| *d)
    }

    /// Highest checkpoint reported.
    pub fn last_ckpt(&self) -> Option<(Seqno, Digest)> {
        self.checkpoints.iter().max_by_key(|(n, _)| *n).copied()
    }

    /// Highest sequence number with an entry, or `last_stable` if none.
    pub fn max_seqno(&self) -> Seqno {
        self.requests
            .iter()
            .map(|e| e.seqno)
            .max()
            .unwrap_or(self.last_stable)
            .max(self.last_stable)
    }

    /// Entry for `seqno` above the sender's stable checkpoint.
    pub fn proofs(&self, seqno: Seqno) -> Option<&ViewChangeEntry> {
        if seqno <= self.last_stable {
            return None;
        }
        self.requests
            .binary_search_by_key(&seqno, |e| e.seqno)
            .ok()
            .map(|i| &self.requests[i])
    }

    /// Prepared view and digest for `seqno`; `None` stands for null.
    ///
    /// A value the sender only pre-prepared is not a proposal here. It still
    /// counts as a proof through [`proofs`](Self::proofs).
    pub fn req(&self, seqno: Seqno) -> (Option<View>, Digest) {
        match self.proofs(seqno) {
            Some(entry) if entry.prepared => (Some(entry.view), entry.digest),
            _ => (None, Digest::ZERO),
        }
    }

    /// Structural checks a received message must pass.
    pub fn is_well_formed(&self, max_out: u64) -> bool {
        let Some(high) = self.last_stable.checked_add(max_out) else {
            return false;
        };
        let in_window = |n: Seqno| n > self.last_stable && n <= high;
        let sorted = self.requests.windows(2).all(|w| w[0].seqno < w[1].seqno);
        let entries_ok = self.requests.iter().all(|e| {
            in_window(e.seqno)
                && e.view < self.view
                && (!e.prepared || e.last_view.map_or(false, |lv| lv >= e.view))
        });
        let ckpts_ok = self
            .checkpoints
            .iter()
            .all(|(n, _)| *n >= self.last_stable && *n <= high);
        sorted && entries_ok && ckpts_ok && self.ckpt(self.last_stable).is_some()
    }
}

/// A backup's acknowledgement that it holds `vc_sender`'s view-change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeAck {
    pub view: View,
    pub sender: ReplicaId,
    pub vc_sender: ReplicaId,
    pub vc_digest: Digest,
}

/// The new primary's decision for a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: View,
    /// Chosen checkpoint.
    pub min: Seqno,
    /// One past the highest sequence number carried over.
    pub max: Seqno,
    /// Digest of each view-change the decision is based on.
    pub vc_digests: Vec<Option<Digest>>,
    /// Replica whose view-change supplied the value for each sequence number
    /// in `[min, max)`.
    pub picks: BTreeMap<Seqno, ReplicaId>,
    pub sender: ReplicaId,
}

impl NewView {
    pub fn new(view: View, replica_count: usize, sender: ReplicaId) -> Self {
        Self {
            view,
            min: 0,
            max: 0,
            vc_digests: vec![None; replica_count],
            picks: BTreeMap::new(),
            sender,
        }
    }

    pub fn add_view_change(&mut self, replica: ReplicaId, digest: Digest) {
        if let Some(slot) = self.vc_digests.get_mut(replica) {
            *slot = Some(digest);
        }
    }

    /// Digest of `replica`'s view-change if it is part of the decision.
    pub fn view_change(&self, replica: ReplicaId) -> Option<Digest> {
        self.vc_digests.get(replica).copied().flatten()
    }

    pub fn pick(&mut self, replica: ReplicaId, seqno: Seqno) {
        self.picks.insert(seqno, replica);
    }

    pub fn which_picked(&self, seqno: Seqno) -> Option<ReplicaId> {
        self.picks.get(&seqno).copied()
    }

    /// Structural checks a received message must pass.
    pub fn is_well_formed(&self, replica_count: usize, max_out: u64) -> bool {
        self.vc_digests.len() == replica_count
            && self.max > self.min
            && self.max - self.min - 1 <= max_out
            && (self.min..self.max).all(|n| {
                self.which_picked(n)
                    .map_or(false, |r| self.view_change(r).is_some())
            })
    }
}

// =============================================================================
// STATUS / KEYS
// =============================================================================

/// Pre-prepare a replica in a view change is still missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingPrePrepare {
    /// Lowest view of an acceptable pre-prepare.
    pub view: View,
    pub seqno: Seqno,
    /// Bit i set if the i-th out-of-band request is missing.
    pub big_mask: u64,
    /// Prepare proofs are also needed.
    pub need_proofs: bool,
}

/// Periodic negative acknowledgement describing what the sender has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub view: View,
    pub last_stable: Seqno,
    pub last_executed: Seqno,
    pub sender: ReplicaId,
    pub has_new_view: bool,
    pub has_nv_message: bool,
    /// Sequence numbers prepared above `last_executed`.
    pub prepared: Vec<Seqno>,
    /// Sequence numbers committed above `last_executed`.
    pub committed: Vec<Seqno>,
    /// Out-of-band requests missing per sequence number (bit set = missing).
    pub big_requests: Vec<(Seqno, u64)>,
    /// Bit i set if the sender needs nothing more about replica i's view-change.
    pub received_vcs: u64,
    pub missing_pps: Vec<MissingPrePrepare>,
}

impl Status {
    pub fn new(
        view: View,
        last_stable: Seqno,
        last_executed: Seqno,
        sender: ReplicaId,
        has_new_view: bool,
        has_nv_message: bool,
    ) -> Self {
        Self {
            view,
            last_stable,
            last_executed,
            sender,
            has_new_view,
            has_nv_message,
            prepared: Vec::new(),
            committed: Vec::new(),
            big_requests: Vec::new(),
            received_vcs: 0,
            missing_pps: Vec::new(),
        }
    }

    /// The window arithmetic a receiver does on this status stays in range.
    pub fn is_well_formed(&self, max_out: u64) -> bool {
        self.last_stable.checked_add(max_out).is_some() && self.last_executed.checked_add(1).is_some()
    }

    pub fn mark_prepared(&mut self, seqno: Seqno) {
        self.prepared.push(seqno);
    }

    pub fn mark_committed(&mut self, seqno: Seqno) {
        self.committed.push(seqno);
    }

    pub fn is_prepared(&self, seqno: Seqno) -> bool {
        self.prepared.contains(&seqno)
    }

    pub fn is_committed(&self, seqno: Seqno) -> bool {
        self.committed.contains(&seqno)
    }

    pub fn mark_vc(&mut self, replica: ReplicaId) {
        if replica < 64 {
            self.received_vcs |= 1 << replica;
        }
    }

    pub fn has_vc(&self, replica: ReplicaId) -> bool {
        replica < 64 && self.received_vcs & (1 << replica) != 0
    }
}

/// Announcement of a replica's new inbound session-key epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewKey {
    pub sender: ReplicaId,
    pub epoch: u64,
}
