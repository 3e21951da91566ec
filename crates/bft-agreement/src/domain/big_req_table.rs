//! Out-of-band request table.
//!
//! Requests whose command exceeds the configured threshold are not inlined
//! in pre-prepares; the primary orders their digest and every replica
//! obtains the body directly from the client (or, when missing, by asking
//! through a status message). This table matches bodies with the
//! pre-prepare slots waiting for them.

use super::request::Request;
use shared_types::{ClientId, Digest, Seqno, View};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Entry {
    request: Option<Request>,
    /// `(seqno, index)` of pre-prepare slots waiting for the body.
    waiting: Vec<(Seqno, usize)>,
    /// Highest sequence number of a referencing pre-prepare.
    max_seqno: Seqno,
    /// Highest view of a referencing pre-prepare, `None` while unmatched.
    max_view: Option<View>,
}

/// Bodies of out-of-band requests, indexed by digest.
#[derive(Debug)]
pub struct BigRequestTable {
    threshold: usize,
    entries: HashMap<Digest, Entry>,
    /// The single unreferenced request kept per client.
    unmatched: HashMap<ClientId, Digest>,
}

impl BigRequestTable {
    /// Table for requests whose command is larger than `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            entries: HashMap::new(),
            unmatched: HashMap::new(),
        }
    }

    /// True if `request` travels out of band.
    pub fn is_big(&self, request: &Request) -> bool {
        !request.read_only && request.command.len() > self.threshold
    }

    /// Record that the pre-prepare `(view, seqno)` references `digest` at
    /// position `index`. Returns true if the body is already present.
    pub fn add_pre_prepare(
        &mut self,
        digest: Digest,
        index: usize,
        seqno: Seqno,
        view: View,
    ) -> bool {
        let entry = self.entries.entry(digest).or_default();
        entry.max_seqno = entry.max_seqno.max(seqno);
        entry.max_view = Some(entry.max_view.map_or(view, |v| v.max(view)));
        match &entry.request {
            Some(request) => {
                let client = request.client_id;
                if self.unmatched.get(&client) == Some(&digest) {
                    self.unmatched.remove(&client);
                }
                true
            }
            None => {
                if !entry.waiting.contains(&(seqno, index)) {
                    entry.waiting.push((seqno, index));
                }
                false
            }
        }
    }

    /// Offer a request body.
    ///
    /// Returns the pre-prepare slots that were waiting for it, or `None` if
    /// the body was not stored. Unreferenced bodies are only kept when
    /// `verified`, and at most one per client.
    pub fn add_request(&mut self, request: Request, verified: bool) -> Option<Vec<(Seqno, usize)>> {
        let digest = request.digest();
        if let Some(entry) = self.entries.get_mut(&digest) {
            if entry.request.is_some() {
                return Some(Vec::new());
            }
            entry.request = Some(request);
            return Some(std::mem::take(&mut entry.waiting));
        }
        if !verified {
            return None;
        }

        let client = request.client_id;
        if let Some(old) = self.unmatched.get(&client).copied() {
            let newer = self
                .entries
                .get(&old)
                .and_then(|e| e.request.as_ref())
                .map_or(true, |r| r.request_id < request.request_id);
            if !newer {
                return None;
            }
            self.entries.remove(&old);
        }
        self.entries.insert(
            digest,
            Entry {
                request: Some(request),
                ..Entry::default()
            },
        );
        self.unmatched.insert(client, digest);
        Some(Vec::new())
    }

    pub fn lookup(&self, digest: &Digest) -> Option<&Request> {
        self.entries.get(digest).and_then(|e| e.request.as_ref())
    }

    /// Discard bodies only referenced at or below the stable checkpoint.
    pub fn mark_stable(&mut self, last_stable: Seqno) {
        self.entries
            .retain(|_, e| e.max_view.is_none() || e.max_seqno > last_stable);
        self.retain_unmatched();
    }

    /// Discard bodies whose references all come from views before `view`.
    ///
    /// Pre-prepares carried into the view change are re-registered before
    /// this runs.
    pub fn view_change(&mut self, view: View) {
        self.entries
            .retain(|_, e| e.max_view.map_or(true, |v| v >= view));
        self.retain_unmatched();
    }

    fn retain_unmatched(&mut self) {
        let entries = &self.entries;
        self.unmatched.retain(|_, d| entries.contains_key(d));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
