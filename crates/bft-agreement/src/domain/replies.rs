//! Last reply per client.
//!
//! The cache is part of the replicated state: it is checkpointed with the
//! application, restored on rollback, and replaced when state is fetched.

use super::request::Reply;
use serde::{Deserialize, Serialize};
use shared_types::{ClientId, CodecError, ReplicaId, RequestId, View};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedReply {
    request_id: RequestId,
    result: Vec<u8>,
    committed: bool,
}

#[derive(Serialize, Deserialize)]
struct EncodedEntry {
    client: ClientId,
    request_id: RequestId,
    result: Vec<u8>,
}

/// Reply cache used for duplicate suppression and retransmission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyCache {
    entries: BTreeMap<ClientId, CachedReply>,
}

impl ReplyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the last request executed for `client`, 0 if none.
    pub fn req_id(&self, client: ClientId) -> RequestId {
        self.entries.get(&client).map_or(0, |e| e.request_id)
    }

    /// Store the result of executing `request_id` for `client`.
    pub fn record(&mut self, client: ClientId, request_id: RequestId, result: Vec<u8>, committed: bool) {
        self.entries.insert(
            client,
            CachedReply {
                request_id,
                result,
                committed,
            },
        );
    }

    /// Mark the cached reply of `client` as committed.
    pub fn commit(&mut self, client: ClientId) {
        if let Some(entry) = self.entries.get_mut(&client) {
            entry.committed = true;
        }
    }

    pub fn is_committed(&self, client: ClientId) -> bool {
        self.entries.get(&client).map_or(false, |e| e.committed)
    }

    /// Cached reply to `client` as sent by `sender` in `view`.
    pub fn reply(&self, client: ClientId, view: View, sender: ReplicaId) -> Option<Reply> {
        self.entries.get(&client).map(|e| Reply {
            view,
            request_id: e.request_id,
            client_id: client,
            sender,
            tentative: !e.committed,
            result: e.result.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical encoding for checkpoints. Commit flags are not part of it:
    /// a checkpoint only covers executed, committed sequence numbers.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let entries: Vec<EncodedEntry> = self
            .entries
            .iter()
            .map(|(client, e)| EncodedEntry {
                client: *client,
                request_id: e.request_id,
                result: e.result.clone(),
            })
            .collect();
        bincode::serialize(&entries).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Inverse of [`encode`](Self::encode); every entry comes back committed.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        let entries: Vec<EncodedEntry> =
            bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(Self {
            entries: entries
                .into_iter()
                .map(|e| {
                    (
                        e.client,
                        CachedReply {
                            request_id: e.request_id,
                            result: e.result,
                            committed: true,
                        },
                    )
                })
                .collect(),
        })
    }
}
