//! Client requests, replies and the primary's request queue.

use super::certificate::Vote;
use serde::{Deserialize, Serialize};
use shared_crypto::Blake3Hasher;
use shared_types::{ClientId, Digest, Mac, ReplicaId, RequestId, View};
use std::collections::{HashMap, VecDeque};

/// Fixed per-request overhead used when sizing batches.
pub const REQUEST_HEADER_SIZE: usize = 32;

/// A client operation to be ordered and executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub client_id: ClientId,
    /// Strictly increasing per client.
    pub request_id: RequestId,
    pub read_only: bool,
    pub command: Vec<u8>,
    /// MAC vector from the client, one slot per replica.
    pub auth: Vec<Mac>,
}

impl Request {
    /// Unauthenticated request. Callers attach `auth` before sending.
    pub fn new(client_id: ClientId, request_id: RequestId, command: Vec<u8>) -> Self {
        Self {
            client_id,
            request_id,
            read_only: false,
            command,
            auth: Vec::new(),
        }
    }

    /// Same request flagged read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Bytes covered by the client authenticator and the digest.
    pub fn content_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(17 + self.command.len());
        bytes.extend_from_slice(&self.client_id.to_le_bytes());
        bytes.extend_from_slice(&self.request_id.to_le_bytes());
        bytes.push(u8::from(self.read_only));
        bytes.extend_from_slice(&self.command);
        bytes
    }

    pub fn digest(&self) -> Digest {
        let mut hasher = Blake3Hasher::new();
        hasher.update_field(b"request").update_field(&self.content_bytes());
        hasher.finalize_digest()
    }

    /// Approximate encoded size.
    pub fn size(&self) -> usize {
        REQUEST_HEADER_SIZE + self.command.len() + self.auth.len() * shared_types::MAC_LEN
    }
}

/// Result of executing a request at one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub view: View,
    pub request_id: RequestId,
    pub client_id: ClientId,
    pub sender: ReplicaId,
    /// Produced by tentative or read-only execution.
    pub tentative: bool,
    pub result: Vec<u8>,
}

impl Vote for Reply {
    fn voter(&self) -> ReplicaId {
        self.sender
    }

    fn same_value(&self, other: &Self) -> bool {
        self.request_id == other.request_id && self.result == other.result
    }
}

#[derive(Debug, Clone, Copy)]
struct InProgress {
    request_id: RequestId,
    view: View,
}

/// FIFO queue holding at most one pending request per client.
///
/// The primary pops batches from the front; backups keep forwarded requests
/// here until they commit, which is what arms the view-change timer.
#[derive(Debug, Default)]
pub struct RequestQueue {
    queue: VecDeque<Request>,
    in_progress: HashMap<ClientId, InProgress>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `request`, replacing an older pending request from the same
    /// client. Returns false if an equal or newer request is already queued.
    pub fn append(&mut self, request: Request) -> bool {
        if let Some(pos) = self
            .queue
            .iter()
            .position(|r| r.client_id == request.client_id)
        {
            if self.queue[pos].request_id >= request.request_id {
                return false;
            }
            self.queue.remove(pos);
        }
        self.queue.push_back(request);
        true
    }

    /// Remove the queued request of `client` if it is not newer than
    /// `request_id`. Returns true if a request was removed.
    pub fn remove(&mut self, client: ClientId, request_id: RequestId) -> bool {
        match self.queue.iter().position(|r| r.client_id == client) {
            Some(pos) if self.queue[pos].request_id <= request_id => {
                self.queue.remove(pos);
                true
            }
            _ => false,
        }
    }

    /// Take the request at the front.
    pub fn pop(&mut self) -> Option<Request> {
        self.queue.pop_front()
    }

    /// Queued request of `client`.
    pub fn first_client(&self, client: ClientId) -> Option<&Request> {
        self.queue.iter().find(|r| r.client_id == client)
    }

    /// True if the primary already ordered `request_id` (or a newer request)
    /// for `client` in `view`.
    pub fn in_progress(&self, client: ClientId, request_id: RequestId, view: View) -> bool {
        self.in_progress
            .get(&client)
            .map(|p| p.view == view && p.request_id >= request_id)
            .unwrap_or(false)
    }

    /// Pop requests from the front while their total size fits `max_size`.
    ///
    /// At least one request is returned if the queue is not empty. `accept`
    /// may refuse a request (for example when the batch has no room left for
    /// out-of-band requests), which ends the batch.
    pub fn pop_batch(
        &mut self,
        view: View,
        max_size: usize,
        mut accept: impl FnMut(&Request) -> bool,
    ) -> Vec<Request> {
        let mut batch = Vec::new();
        let mut size = 0;
        while let Some(front) = self.queue.front() {
            if !batch.is_empty() && size + front.size() > max_size {
                break;
            }
            if !accept(front) {
                break;
            }
            let request = match self.queue.pop_front() {
                Some(request) => request,
                None => break,
            };
            size += request.size();
            self.in_progress.insert(
                request.client_id,
                InProgress {
                    request_id: request.request_id,
                    view,
                },
            );
            batch.push(request);
        }
        batch
    }

    /// Drop queued requests the reply cache shows as already executed.
    ///
    /// Returns true if anything was removed.
    pub fn retain_newer(&mut self, mut last_executed: impl FnMut(ClientId) -> RequestId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|r| r.request_id > last_executed(r.client_id));
        self.queue.len() != before
    }

    /// Forget which requests the primary ordered.
    pub fn clear_in_progress(&mut self) {
        self.in_progress.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_progress.clear();
    }
}
