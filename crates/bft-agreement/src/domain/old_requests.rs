//! Log of what the local replica proposed or prepared in earlier views.
//!
//! View-change messages are built from this log, and the new primary reads
//! pre-prepares out of it when it already holds the value it must re-propose.

use super::messages::PrePrepare;
use super::seq_log::{LogSlot, SequenceLog};
use serde::{Deserialize, Serialize};
use shared_types::{Digest, Seqno, View};
use std::sync::Arc;

/// Knowledge about one sequence number carried across views.
#[derive(Debug, Clone, Default)]
pub struct OldRequestInfo {
    /// View in which `digest` was pre-prepared (or prepared). `None` is null.
    pub view: Option<View>,
    /// See [`ViewChangeEntry::last_view`](super::messages::ViewChangeEntry).
    pub last_view: Option<View>,
    pub digest: Digest,
    /// Present iff the value prepared locally.
    pub pre_prepare: Option<Arc<PrePrepare>>,
    /// Earlier digests this replica sent prepares for, with their last view.
    pub old_digests: Vec<(Option<View>, Digest)>,
}

impl LogSlot for OldRequestInfo {
    fn clear(&mut self) {
        *self = OldRequestInfo::default();
    }
}

/// Persisted form of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedOldRequest {
    pub seqno: Seqno,
    pub view: Option<View>,
    pub last_view: Option<View>,
    pub digest: Digest,
    pub pre_prepare: Option<PrePrepare>,
}

impl PersistedOldRequest {
    /// Invariants every restored entry satisfies.
    pub fn is_consistent(&self) -> bool {
        match &self.pre_prepare {
            Some(pp) => {
                pp.digest() == self.digest
                    && Some(pp.view) == self.view
                    && pp.seqno == self.seqno
                    && self.last_view >= self.view
            }
            None => self.view.is_none() || self.last_view < self.view,
        }
    }
}

/// Window of [`OldRequestInfo`] above the last stable checkpoint.
#[derive(Debug, Clone)]
pub struct OldRequestLog {
    log: SequenceLog<OldRequestInfo>,
    /// Old digests remembered per sequence number (f + 2).
    keep: usize,
}

impl OldRequestLog {
    pub fn new(max_out: u64, last_stable: Seqno, f: usize) -> Self {
        Self {
            log: SequenceLog::new(max_out, last_stable, OldRequestInfo::default),
            keep: f + 2,
        }
    }

    pub fn within_range(&self, n: Seqno) -> bool {
        self.log.within_range(n)
    }

    /// Record a value that prepared in `view`.
    pub fn add_complete(&mut self, pp: Arc<PrePrepare>, view: View) {
        assert_eq!(pp.view, view, "prepared pre-prepare from another view");
        let info = self.log.fetch(pp.seqno);
        assert!(
            info.view.map_or(true, |v| v < view),
            "view-change log regressed at seqno {}",
            pp.seqno
        );
        info.view = Some(view);
        info.last_view = Some(view);
        info.digest = pp.digest();
        info.pre_prepare = Some(pp);
        info.old_digests.clear();
    }

    /// Record that the local replica pre-prepared `digest` for `n` in
    /// `view` without it preparing.
    pub fn add_incomplete(&mut self, n: Seqno, digest: Digest, view: View) {
        let keep = self.keep;
        let info = self.log.fetch(n);

        if info.view.is_some() && info.digest == digest {
            if info.pre_prepare.is_some() {
                info.last_view = Some(view);
            } else {
                info.view = Some(view);
            }
            return;
        }

        if info.pre_prepare.take().is_none() {
            info.last_view = info.view;
        }
        if info.view.is_some() {
            let previous = (info.last_view, info.digest);
            if let Some(slot) = info.old_digests.iter_mut().find(|(_, d)| *d == previous.1) {
                slot.0 = previous.0;
            } else if info.old_digests.len() < keep {
                info.old_digests.push(previous);
            } else if let Some(slot) = info.old_digests.iter_mut().min_by_key(|(v, _)| *v) {
                *slot = previous;
            }
        }
        info.digest = digest;
        info.view = Some(view);
    }

    pub fn get(&self, n: Seqno) -> Option<&OldRequestInfo> {
        self.log.get(n)
    }

    /// Logged pre-prepare for `n` with digest `digest`.
    pub fn pre_prepare(&self, n: Seqno, digest: &Digest) -> Option<&Arc<PrePrepare>> {
        self.log
            .get(n)
            .filter(|info| info.digest == *digest)
            .and_then(|info| info.pre_prepare.as_ref())
    }

    /// Logged pre-prepare for `n` from `view` or later.
    pub fn pre_prepare_since(&self, n: Seqno, view: View) -> Option<&Arc<PrePrepare>> {
        self.log
            .get(n)
            .filter(|info| info.view.map_or(false, |v| v >= view))
            .and_then(|info| info.pre_prepare.as_ref())
    }

    /// True if the local replica ever sent a prepare for `digest` at `n`.
    pub fn sent_prepare(&self, n: Seqno, digest: &Digest) -> bool {
        self.log.get(n).map_or(false, |info| {
            (info.view.is_some() && info.digest == *digest)
                || info.old_digests.iter().any(|(_, d)| d == digest)
        })
    }

    /// Old digests for `n` last prepared in `view` or later.
    pub fn proofs(&self, n: Seqno, view: View) -> Vec<(View, Digest)> {
        self.log.get(n).map_or_else(Vec::new, |info| {
            info.old_digests
                .iter()
                .filter_map(|(v, d)| v.filter(|v| *v >= view).map(|v| (v, *d)))
                .collect()
        })
    }

    /// Non-null entries in ascending order.
    pub fn entries(&self) -> impl Iterator<Item = (Seqno, &OldRequestInfo)> {
        self.log.iter().filter(|(_, info)| info.view.is_some())
    }

    pub fn truncate(&mut self, last_stable: Seqno) {
        self.log.truncate(last_stable);
    }

    pub fn reset(&mut self, last_stable: Seqno) {
        self.log.reset(last_stable);
    }

    /// Entries for persistence.
    pub fn export(&self) -> Vec<PersistedOldRequest> {
        self.entries()
            .map(|(seqno, info)| PersistedOldRequest {
                seqno,
                view: info.view,
                last_view: info.last_view,
                digest: info.digest,
                pre_prepare: info.pre_prepare.as_deref().cloned(),
            })
            .collect()
    }

    /// Restore one persisted entry. Returns false if it is inconsistent or
    /// outside the window.
    pub fn import(&mut self, entry: PersistedOldRequest) -> bool {
        if !entry.is_consistent() || !self.log.within_range(entry.seqno) {
            return false;
        }
        let info = self.log.fetch(entry.seqno);
        info.view = entry.view;
        info.last_view = entry.last_view;
        info.digest = entry.digest;
        info.pre_prepare = entry.pre_prepare.map(Arc::new);
        true
    }
}
