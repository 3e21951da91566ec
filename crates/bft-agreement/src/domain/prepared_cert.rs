//! Per-sequence-number prepare state.

use super::big_req_table::BigRequestTable;
use super::certificate::Certificate;
use super::messages::{PrePrepare, Prepare};
use super::quorum::QuorumParams;
use super::seq_log::LogSlot;
use shared_types::{Digest, ReplicaId};
use std::sync::Arc;
use std::time::Instant;

/// A pre-prepare plus the out-of-band request bodies it still lacks.
#[derive(Debug, Clone, Default)]
pub struct PrePrepareInfo {
    pp: Option<Arc<PrePrepare>>,
    /// Bit i set while the i-th out-of-band request is missing.
    missing: u64,
}

impl PrePrepareInfo {
    /// Store `pp`, registering its out-of-band references with `brt`.
    pub fn add(&mut self, pp: Arc<PrePrepare>, brt: &mut BigRequestTable) {
        let mut missing = 0u64;
        for (i, digest) in pp.big_requests().iter().enumerate() {
            if !brt.add_pre_prepare(*digest, i, pp.seqno, pp.view) {
                missing |= 1 << i;
            }
        }
        self.missing = missing;
        self.pp = Some(pp);
    }

    /// Store `pp` whose bodies are known to be present.
    pub fn add_complete(&mut self, pp: Arc<PrePrepare>) {
        self.missing = 0;
        self.pp = Some(pp);
    }

    /// Record that the body `digest` referenced at `index` arrived.
    pub fn add_missing(&mut self, digest: &Digest, index: usize) {
        if let Some(pp) = &self.pp {
            if pp.big_requests().get(index) == Some(digest) {
                self.missing &= !(1 << index);
            }
        }
    }

    pub fn pre_prepare(&self) -> Option<&Arc<PrePrepare>> {
        self.pp.as_ref()
    }

    /// Bitmap of missing out-of-band bodies.
    pub fn missing_reqs(&self) -> u64 {
        self.missing
    }

    /// True once the pre-prepare and all its bodies are present.
    pub fn is_complete(&self) -> bool {
        self.pp.is_some() && self.missing == 0
    }

    pub fn clear(&mut self) {
        self.pp = None;
        self.missing = 0;
    }
}

/// Pre-prepare and prepare certificate for one sequence number.
///
/// Prepared once the pre-prepare (with all its bodies) is present and `2f`
/// matching prepares from backups agree with its digest; the primary's
/// pre-prepare stands in for its own prepare.
#[derive(Debug, Clone)]
pub struct PreparedCert {
    info: PrePrepareInfo,
    prepares: Certificate<Prepare>,
    /// Set when the local replica proposed the pre-prepare.
    primary: bool,
    pp_sent_at: Option<Instant>,
}

impl PreparedCert {
    pub fn new(quorum: QuorumParams, me: ReplicaId) -> Self {
        Self {
            info: PrePrepareInfo::default(),
            prepares: Certificate::new(quorum.prepare_quorum(), quorum.weak(), me),
            primary: false,
            pp_sent_at: None,
        }
    }

    /// Accept a pre-prepare received from the primary.
    ///
    /// Refused if one is already held or if it disagrees with a prepare
    /// value already known to be correct.
    pub fn add_pre_prepare(&mut self, pp: Arc<PrePrepare>, brt: &mut BigRequestTable) -> bool {
        if self.info.pre_prepare().is_some() {
            return false;
        }
        if let Some(known) = self.prepares.correct_value() {
            if known.digest != pp.digest() || known.view != pp.view {
                return false;
            }
        }
        self.info.add(pp, brt);
        true
    }

    /// Record the pre-prepare the local replica proposed as primary.
    pub fn add_my_pre_prepare(&mut self, pp: Arc<PrePrepare>, now: Instant) -> bool {
        if self.info.pre_prepare().is_some() {
            return false;
        }
        self.info.add_complete(pp);
        self.primary = true;
        self.pp_sent_at = Some(now);
        true
    }

    /// Install a pre-prepare carried over by a new view.
    pub fn add_old(&mut self, pp: Arc<PrePrepare>, brt: &mut BigRequestTable) {
        self.info.add(pp, brt);
    }

    pub fn add_prepare(&mut self, prepare: Prepare) -> bool {
        self.prepares.add(prepare)
    }

    pub fn add_my_prepare(&mut self, prepare: Prepare, now: Instant) -> bool {
        self.prepares.add_mine(prepare, now)
    }

    /// An out-of-band body referenced at `index` arrived.
    pub fn add_missing(&mut self, digest: &Digest, index: usize) {
        self.info.add_missing(digest, index);
    }

    pub fn pre_prepare(&self) -> Option<&Arc<PrePrepare>> {
        self.info.pre_prepare()
    }

    /// The pre-prepare if the local replica proposed it.
    pub fn my_pre_prepare(&self) -> Option<&Arc<PrePrepare>> {
        if self.primary {
            self.info.pre_prepare()
        } else {
            None
        }
    }

    pub fn my_prepare(&self) -> Option<&Prepare> {
        self.prepares.mine()
    }

    pub fn prepares(&self) -> &Certificate<Prepare> {
        &self.prepares
    }

    /// Prepares agreeing with the correct value.
    pub fn num_correct(&self) -> usize {
        self.prepares.num_correct()
    }

    pub fn missing_reqs(&self) -> u64 {
        self.info.missing_reqs()
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// True once the pre-prepare and all its bodies are present.
    pub fn is_pp_complete(&self) -> bool {
        self.info.is_complete()
    }

    /// True once prepared.
    pub fn is_complete(&self) -> bool {
        let Some(pp) = self.info.pre_prepare() else {
            return false;
        };
        if !self.info.is_complete() {
            return false;
        }
        self.prepares
            .value()
            .map_or(false, |p| p.digest == pp.digest() && p.view == pp.view)
    }

    /// Drop unauthenticated state received under rotated keys.
    pub fn mark_stale(&mut self) {
        if !self.is_complete() {
            self.prepares.mark_stale();
        }
    }

    /// Move the pre-prepare out for the view-change log and reset the slot.
    pub fn take_pre_prepare(&mut self) -> Option<Arc<PrePrepare>> {
        let pp = self.info.pp.take();
        self.clear();
        pp
    }

    pub fn clear(&mut self) {
        self.info.clear();
        self.prepares.clear();
        self.primary = false;
        self.pp_sent_at = None;
    }
}

impl LogSlot for PreparedCert {
    fn clear(&mut self) {
        PreparedCert::clear(self);
    }
}
