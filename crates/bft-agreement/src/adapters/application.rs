//! Replicated key-value store
//!
//! A small deterministic service used to exercise the engine end to end.

use crate::ports::Application;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared_types::{ClientId, Seqno};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Operations understood by [`KvApplication`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: Vec<u8>, value: Vec<u8> },
    Get { key: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        // Plain enums of byte vectors always serialize.
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

/// Result of a [`KvCommand`]: the previous or current value.
pub fn decode_kv_result(bytes: &[u8]) -> Option<Option<Vec<u8>>> {
    bincode::deserialize(bytes).ok()
}

/// Shared map holding the application state.
///
/// The state adapter snapshots and restores it; clones share the map.
#[derive(Clone, Default)]
pub struct KvStore {
    map: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.map.read().clone()
    }

    pub fn restore(&self, map: BTreeMap<Vec<u8>, Vec<u8>>) {
        *self.map.write() = map;
    }

    fn apply(&self, command: KvCommand, read_only: bool) -> Option<Vec<u8>> {
        match command {
            KvCommand::Get { key } => self.get(&key),
            // Writes are refused on the read-only path.
            KvCommand::Put { .. } | KvCommand::Delete { .. } if read_only => None,
            KvCommand::Put { key, value } => self.map.write().insert(key, value),
            KvCommand::Delete { key } => self.map.write().remove(&key),
        }
    }
}

/// [`Application`] over a [`KvStore`].
pub struct KvApplication {
    store: KvStore,
}

impl KvApplication {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }
}

impl Application for KvApplication {
    fn exec(
        &self,
        command: &[u8],
        _choices: &[u8],
        _client: ClientId,
        read_only: bool,
        _tentative: bool,
    ) -> Vec<u8> {
        let result = match KvCommand::decode(command) {
            Some(command) => self.store.apply(command, read_only),
            None => None,
        };
        bincode::serialize(&result).unwrap_or_default()
    }

    /// The sequence number serves as a logical timestamp.
    fn non_det_choices(&self, seqno: Seqno) -> Vec<u8> {
        seqno.to_le_bytes().to_vec()
    }

    fn check_non_det(&self, choices: &[u8]) -> bool {
        choices.len() == 8
    }
}
