//! Stable checkpoints reported above the local window.

use super::messages::Checkpoint;
use shared_types::{ReplicaId, Seqno};
use std::time::Duration;

/// How long a replica keeps waiting for its own commits before treating an
/// in-window stable checkpoint from a peer as a sign it fell behind.
pub const LATE_CHECKPOINT_GRACE: Duration = Duration::from_millis(200);

/// The latest stable checkpoint each peer reported beyond what the local
/// replica can process.
///
/// Once more than f peers are in the set, at least one correct replica is
/// ahead and the local replica starts a state fetch.
#[derive(Debug, Clone)]
pub struct StableCheckpointSet {
    slots: Vec<Option<Checkpoint>>,
}

impl StableCheckpointSet {
    pub fn new(replica_count: usize) -> Self {
        Self {
            slots: vec![None; replica_count],
        }
    }

    pub fn fetch(&self, sender: ReplicaId) -> Option<&Checkpoint> {
        self.slots.get(sender).and_then(Option::as_ref)
    }

    /// Keep `checkpoint` if it is newer than the one held for its sender.
    pub fn store(&mut self, checkpoint: Checkpoint) -> bool {
        debug_assert!(checkpoint.stable, "only stable checkpoints enter the set");
        let Some(slot) = self.slots.get_mut(checkpoint.sender) else {
            return false;
        };
        match slot {
            Some(held) if held.seqno >= checkpoint.seqno => false,
            _ => {
                *slot = Some(checkpoint);
                true
            }
        }
    }

    pub fn remove(&mut self, sender: ReplicaId) -> Option<Checkpoint> {
        self.slots.get_mut(sender).and_then(Option::take)
    }

    /// Number of senders held.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Senders reporting a stable checkpoint at or above `seqno`.
    pub fn count_at_least(&self, seqno: Seqno) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|c| c.seqno >= seqno)
            .count()
    }

    /// After the window moved to `(last_stable, last_stable + max_out]`:
    /// drop entries at or below `last_stable` and hand back the ones that
    /// now fall inside the window.
    pub fn take_within(&mut self, last_stable: Seqno, max_out: u64) -> Vec<Checkpoint> {
        let mut within = Vec::new();
        for slot in &mut self.slots {
            let Some(seqno) = slot.as_ref().map(|c| c.seqno) else {
                continue;
            };
            if seqno <= last_stable {
                *slot = None;
            } else if seqno <= last_stable + max_out {
                if let Some(checkpoint) = slot.take() {
                    within.push(checkpoint);
                }
            }
        }
        within
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}
