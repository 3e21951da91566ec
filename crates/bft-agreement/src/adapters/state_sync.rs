//! In-memory checkpoints and state transfer
//!
//! Each replica keeps full copies of its [`KvStore`] at checkpoint sequence
//! numbers. Replicas of one simulated deployment publish their checkpoints
//! to a [`SharedCheckpointStore`], which stands in for the network when a
//! replica fetches state it is missing.

use super::application::KvStore;
use crate::ports::{RestoredState, StateSync};
use parking_lot::RwLock;
use shared_crypto::Blake3Hasher;
use shared_types::{Digest, ReplicaId, Seqno};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

type Snapshot = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    digest: Digest,
    snapshot: Snapshot,
    protocol_state: Vec<u8>,
}

fn checkpoint_digest(snapshot: &Snapshot, protocol_state: &[u8]) -> Digest {
    let mut hasher = Blake3Hasher::new();
    hasher.update_field(b"checkpoint");
    for (key, value) in snapshot {
        hasher.update_field(key).update_field(value);
    }
    hasher.update_field(protocol_state);
    hasher.finalize_digest()
}

#[derive(Debug, Clone)]
struct Published {
    checkpoint: StoredCheckpoint,
    holders: HashSet<ReplicaId>,
}

/// Checkpoints published by the replicas of one deployment.
#[derive(Debug, Default)]
pub struct SharedCheckpointStore {
    entries: RwLock<BTreeMap<Seqno, Vec<Published>>>,
}

impl SharedCheckpointStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn publish(&self, replica: ReplicaId, seqno: Seqno, checkpoint: &StoredCheckpoint) {
        let mut entries = self.entries.write();
        let at = entries.entry(seqno).or_default();
        match at
            .iter_mut()
            .find(|p| p.checkpoint.digest == checkpoint.digest)
        {
            Some(published) => {
                published.holders.insert(replica);
            }
            None => at.push(Published {
                checkpoint: checkpoint.clone(),
                holders: HashSet::from([replica]),
            }),
        }
    }

    /// Checkpoint at `seqno` with `digest`, if any replica published it.
    fn lookup(&self, seqno: Seqno, digest: &Digest) -> Option<StoredCheckpoint> {
        self.entries
            .read()
            .get(&seqno)?
            .iter()
            .find(|p| p.checkpoint.digest == *digest)
            .map(|p| p.checkpoint.clone())
    }

    /// Newest checkpoint above `above` vouched for by at least `weak` replicas.
    fn latest_vouched(&self, above: Seqno, weak: usize) -> Option<(Seqno, StoredCheckpoint)> {
        let entries = self.entries.read();
        entries.range(above + 1..).rev().find_map(|(seqno, at)| {
            at.iter()
                .find(|p| p.holders.len() >= weak)
                .map(|p| (*seqno, p.checkpoint.clone()))
        })
    }

    /// Number of distinct sequence numbers with published checkpoints.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct FetchTarget {
    last_executed: Seqno,
    seqno: Option<Seqno>,
    digest: Option<Digest>,
}

/// [`StateSync`] over a [`KvStore`].
pub struct InMemoryStateSync {
    id: ReplicaId,
    store: KvStore,
    registry: Arc<SharedCheckpointStore>,
    /// Replicas that must vouch for a checkpoint fetched without a target.
    weak: usize,
    checkpoints: RwLock<BTreeMap<Seqno, StoredCheckpoint>>,
    fetch: RwLock<Option<FetchTarget>>,
}

impl InMemoryStateSync {
    pub fn new(
        id: ReplicaId,
        store: KvStore,
        registry: Arc<SharedCheckpointStore>,
        weak: usize,
    ) -> Self {
        Self {
            id,
            store,
            registry,
            weak,
            checkpoints: RwLock::new(BTreeMap::new()),
            fetch: RwLock::new(None),
        }
    }

    /// Sequence numbers of the checkpoints still retained.
    pub fn retained(&self) -> Vec<Seqno> {
        self.checkpoints.read().keys().copied().collect()
    }

    fn install(&self, seqno: Seqno, checkpoint: StoredCheckpoint) -> RestoredState {
        self.store.restore(checkpoint.snapshot.clone());
        let protocol_state = checkpoint.protocol_state.clone();
        self.registry.publish(self.id, seqno, &checkpoint);
        self.checkpoints.write().insert(seqno, checkpoint);
        RestoredState {
            seqno,
            protocol_state,
        }
    }
}

impl StateSync for InMemoryStateSync {
    fn digest(&self, seqno: Seqno) -> Option<Digest> {
        self.checkpoints.read().get(&seqno).map(|c| c.digest)
    }

    fn checkpoint(&self, seqno: Seqno, protocol_state: Vec<u8>) -> Digest {
        let snapshot = self.store.snapshot();
        let digest = checkpoint_digest(&snapshot, &protocol_state);
        let checkpoint = StoredCheckpoint {
            digest,
            snapshot,
            protocol_state,
        };
        self.registry.publish(self.id, seqno, &checkpoint);
        self.checkpoints.write().insert(seqno, checkpoint);
        digest
    }

    fn rollback(&self) -> RestoredState {
        let checkpoints = self.checkpoints.read();
        match checkpoints.iter().next_back() {
            Some((seqno, checkpoint)) => {
                self.store.restore(checkpoint.snapshot.clone());
                RestoredState {
                    seqno: *seqno,
                    protocol_state: checkpoint.protocol_state.clone(),
                }
            }
            None => {
                self.store.restore(Snapshot::new());
                RestoredState {
                    seqno: 0,
                    protocol_state: Vec::new(),
                }
            }
        }
    }

    fn discard_checkpoint(&self, seqno: Seqno, last_executed: Seqno) {
        let mut checkpoints = self.checkpoints.write();
        // The newest checkpoint at or below last_executed is kept for rollback.
        let keep = checkpoints
            .range(..=last_executed)
            .next_back()
            .map(|(n, _)| *n);
        checkpoints.retain(|n, _| *n >= seqno || Some(*n) == keep);
    }

    fn start_fetch(
        &self,
        last_executed: Seqno,
        target: Option<Seqno>,
        digest: Option<Digest>,
        _stable: bool,
    ) {
        tracing::debug!(
            replica = self.id,
            last_executed,
            target = ?target,
            "[bft] state fetch requested"
        );
        *self.fetch.write() = Some(FetchTarget {
            last_executed,
            seqno: target,
            digest,
        });
    }

    fn poll_fetch(&self) -> Option<RestoredState> {
        let target = (*self.fetch.read())?;
        let found = match (target.seqno, target.digest) {
            (Some(seqno), Some(digest)) => {
                self.registry.lookup(seqno, &digest).map(|c| (seqno, c))
            }
            _ => self
                .registry
                .latest_vouched(target.last_executed, self.weak),
        };
        let (seqno, checkpoint) = found?;
        *self.fetch.write() = None;
        Some(self.install(seqno, checkpoint))
    }

    fn in_fetch(&self) -> bool {
        self.fetch.read().is_some()
    }

    fn in_check(&self) -> bool {
        false
    }

    fn mark_stale(&self) {}
}
