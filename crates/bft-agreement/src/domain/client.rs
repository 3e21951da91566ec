//! Client side of the protocol: building requests and collecting replies.
//!
//! A reply is trusted once enough replicas agree on it. Committed replies
//! need f+1 matching copies, since at least one comes from a correct
//! replica. Tentative replies may still be rolled back by a view change,
//! so they need 2f+1.

use super::certificate::Certificate;
use super::quorum::QuorumParams;
use super::request::{Reply, Request};
use shared_crypto::SessionKeys;
use shared_types::{ClientId, Principal, RequestId};

/// Replies gathered for one outstanding request.
#[derive(Debug, Clone)]
pub struct ReplyCollector {
    request_id: RequestId,
    committed: Certificate<Reply>,
    tentative: Certificate<Reply>,
}

impl ReplyCollector {
    pub fn new(quorum: QuorumParams, request_id: RequestId) -> Self {
        // No replica has index n, so neither certificate has a "mine" slot.
        let outsider = quorum.n;
        Self {
            request_id,
            committed: Certificate::new(quorum.weak(), quorum.weak(), outsider),
            tentative: Certificate::new(quorum.quorum(), quorum.weak(), outsider),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Count `reply`. Returns the agreed reply once one is complete.
    pub fn add(&mut self, reply: Reply) -> Option<&Reply> {
        if reply.request_id != self.request_id {
            return None;
        }
        if !reply.tentative {
            self.committed.add(reply.clone());
        }
        self.tentative.add(reply);
        self.result()
    }

    /// The agreed reply, preferring the committed certificate.
    pub fn result(&self) -> Option<&Reply> {
        self.committed.value().or_else(|| self.tentative.value())
    }

    pub fn is_complete(&self) -> bool {
        self.result().is_some()
    }

    /// Drop tentative replies, for example after the client learns that a
    /// view change happened while it waited.
    pub fn clear_tentative(&mut self) {
        if !self.tentative.is_complete() {
            self.tentative.clear();
        }
    }
}

/// A client with at most one outstanding request.
pub struct ClientSession {
    id: ClientId,
    quorum: QuorumParams,
    keys: SessionKeys,
    last_request_id: RequestId,
    outstanding: Option<(Request, ReplyCollector)>,
}

impl ClientSession {
    /// Session for client `id`, keyed from the deployment `master` secret.
    pub fn new(id: ClientId, quorum: QuorumParams, master: [u8; 32]) -> Self {
        Self {
            id,
            quorum,
            keys: SessionKeys::new(Principal::Client(id), quorum.n, master),
            last_request_id: 0,
            outstanding: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Build the next request, authenticated for every replica.
    ///
    /// Replaces any outstanding request; its replies are discarded.
    pub fn request(&mut self, command: Vec<u8>, read_only: bool) -> Request {
        self.last_request_id += 1;
        let mut request = Request::new(self.id, self.last_request_id, command);
        if read_only {
            request = request.read_only();
        }
        request.auth = self.keys.authenticator(&request.content_bytes());
        self.outstanding = Some((
            request.clone(),
            ReplyCollector::new(self.quorum, request.request_id),
        ));
        request
    }

    /// The request to retransmit while no reply certificate is complete.
    pub fn outstanding(&self) -> Option<&Request> {
        self.outstanding.as_ref().map(|(request, _)| request)
    }

    /// Count a reply. Returns the agreed reply once complete, ending the
    /// outstanding request.
    pub fn on_reply(&mut self, reply: Reply) -> Option<Reply> {
        let (_, collector) = self.outstanding.as_mut()?;
        let done = collector.add(reply).cloned();
        if done.is_some() {
            self.outstanding = None;
        }
        done
    }

    /// Check a MAC a replica addressed to this client.
    pub fn verify_reply(&self, sender: Principal, data: &[u8], mac: &shared_types::Mac) -> bool {
        self.keys.verify_from(sender, data, mac)
    }
}
