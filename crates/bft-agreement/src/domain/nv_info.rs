//! New-view assembly and checking for one view.
//!
//! The new primary summarizes the view-change messages it accepted until it
//! finds a checkpoint and, for every sequence number above it, a value that
//! enough replicas vouch for. Backups run the same counting over the
//! view-change messages a new-view references to decide whether the
//! primary's picks are correct.
//!
//! ## Counting
//!
//! For a candidate `(view, digest)` at sequence number `n`:
//!
//! - `n_le`: view-changes whose own proposal for `n` is from an earlier or
//!   equal view. A candidate needs N-f of these.
//! - `n_proofs`: view-changes that do not contradict the candidate. f+1
//!   guarantee a correct replica among them.
//! - `n_pproofs`: positive proofs (the sender pre-prepared or prepared the
//!   digest). More than f, or a pre-prepare in the local log, are needed
//!   before the value can be re-proposed.
//!
//! Null candidates need no pre-prepare.

use super::big_req_table::BigRequestTable;
use super::messages::{MissingPrePrepare, NewView, PrePrepare, Prepare, Status, ViewChange, ViewChangeAck};
use super::old_requests::OldRequestLog;
use super::prepared_cert::PrePrepareInfo;
use super::quorum::{kth_largest, QuorumParams};
use super::view_info::ViewAction;
use shared_types::{Digest, ReplicaId, Seqno, View};
use std::sync::Arc;
use std::time::Instant;

/// What [`NewViewInfo`] needs from its owner while it runs.
pub struct NvScope<'a> {
    pub oplog: &'a OldRequestLog,
    pub brt: &'a mut BigRequestTable,
    pub actions: &'a mut Vec<ViewAction>,
    pub now: Instant,
}

#[derive(Debug, Clone, Default)]
struct VcSlot {
    vc: Option<Arc<ViewChange>>,
    ack_count: usize,
    ack_from: u64,
    summarized: bool,
}

#[derive(Debug, Clone, Copy)]
struct CheckpointSummary {
    seqno: Seqno,
    digest: Digest,
    n_proofs: usize,
    n_le: usize,
    max_seqno: Seqno,
    /// First replica whose view-change proposed this checkpoint.
    proposer: ReplicaId,
}

#[derive(Debug, Clone)]
struct RequestSummary {
    view: Option<View>,
    digest: Digest,
    n_proofs: usize,
    n_pproofs: usize,
    pproof_from: u64,
    info: PrePrepareInfo,
    n_le: usize,
    proposer: ReplicaId,
}

impl RequestSummary {
    fn new(view: Option<View>, digest: Digest, proposer: ReplicaId, n_le: usize) -> Self {
        Self {
            view,
            digest,
            n_proofs: 0,
            n_pproofs: 0,
            pproof_from: 0,
            info: PrePrepareInfo::default(),
            n_le,
            proposer,
        }
    }

    fn add_positive(&mut self, replica: ReplicaId) {
        self.n_proofs += 1;
        self.n_pproofs += 1;
        self.pproof_from |= bit(replica);
    }

    fn is_proven(&self, quorum: &QuorumParams) -> bool {
        self.n_proofs >= quorum.weak() && self.n_le >= quorum.quorum()
    }
}

fn bit(replica: ReplicaId) -> u64 {
    if replica < 64 {
        1 << replica
    } else {
        0
    }
}

/// Update `cur` with what `vc` reports for `seqno`.
fn count_proofs(cur: &mut RequestSummary, vc: &ViewChange, seqno: Seqno) {
    let Some(entry) = vc.proofs(seqno) else {
        if seqno > vc.last_stable && cur.view.is_none() {
            cur.n_proofs += 1;
        }
        return;
    };

    let same_digest = entry.digest == cur.digest;
    if entry.prepared {
        if entry.last_view >= cur.view && same_digest {
            cur.add_positive(vc.sender);
        }
    } else if Some(entry.view) >= cur.view && same_digest {
        cur.add_positive(vc.sender);
    } else if cur.view <= entry.last_view {
        cur.n_proofs += 1;
    }
}

/// New-view message, its view-changes and the decision state for one view.
#[derive(Debug, Clone)]
pub struct NewViewInfo {
    quorum: QuorumParams,
    me: ReplicaId,
    /// View of the stored new-view, 0 when empty.
    view: View,
    nv: Option<NewView>,
    /// View-changes referenced by a received new-view.
    vc_target: usize,
    vc_cur: usize,
    vcs: Vec<VcSlot>,
    ckpts: Vec<CheckpointSummary>,
    chosen: Option<usize>,
    /// Set once `min`, `max` and `base` are meaningful.
    range_fixed: bool,
    min: Seqno,
    max: Seqno,
    /// `reqs` and `comp_reqs` are indexed by sequence number minus `base`.
    base: Seqno,
    reqs: Vec<Vec<RequestSummary>>,
    comp_reqs: Vec<Option<usize>>,
    n_complete: u64,
    complete: bool,
    nv_sent: Option<Instant>,
}

impl NewViewInfo {
    pub fn new(quorum: QuorumParams, me: ReplicaId) -> Self {
        Self {
            quorum,
            me,
            view: 0,
            nv: None,
            vc_target: 0,
            vc_cur: 0,
            vcs: vec![VcSlot::default(); quorum.n],
            ckpts: Vec::new(),
            chosen: None,
            range_fixed: false,
            min: 0,
            max: 0,
            base: 0,
            reqs: Vec::new(),
            comp_reqs: Vec::new(),
            n_complete: 0,
            complete: false,
            nv_sent: None,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// True once the replica has everything it needs to enter the view.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Mark complete in `view` without any messages (restart).
    pub fn make_complete(&mut self, view: View) {
        self.view = view;
        self.complete = true;
    }

    pub fn new_view(&self) -> Option<&NewView> {
        self.nv.as_ref()
    }

    /// When the local replica last produced its new-view.
    pub fn nv_sent(&self) -> Option<Instant> {
        self.nv_sent
    }

    pub fn view_change(&self, replica: ReplicaId) -> Option<&Arc<ViewChange>> {
        self.vcs.get(replica).and_then(|s| s.vc.as_ref())
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.quorum, self.me);
    }

    fn is_primary(&self) -> bool {
        self.quorum.primary(self.view) == self.me
    }

    fn index(&self, seqno: Seqno) -> Option<usize> {
        if !self.range_fixed || seqno <= self.min || seqno >= self.max || seqno < self.base {
            return None;
        }
        let idx = (seqno - self.base) as usize;
        (idx < self.comp_reqs.len()).then_some(idx)
    }

    // =========================================================================
    // MESSAGE INTAKE
    // =========================================================================

    /// Store `nv` if it is for a later view than what is held.
    pub fn add_new_view(&mut self, nv: NewView) -> bool {
        if nv.view <= self.view {
            return false;
        }
        if self.view != 0 {
            self.clear();
        }
        self.view = nv.view;
        self.vc_target = nv.vc_digests.iter().filter(|d| d.is_some()).count();
        self.nv = Some(nv);
        true
    }

    /// Store a view-change for this view.
    ///
    /// Backups only keep view-changes the new-view references. The primary
    /// keeps any, but only uses its own and those with enough acks.
    pub fn add_view_change(&mut self, vc: Arc<ViewChange>, scope: &mut NvScope<'_>) -> bool {
        debug_assert_eq!(vc.view, self.view);
        let id = vc.sender;
        if self.complete || id >= self.vcs.len() || self.vcs[id].vc.is_some() {
            return false;
        }
        let Some(nv) = &self.nv else {
            return false;
        };

        let primary = self.is_primary();
        let digest = vc.digest();
        if !primary && nv.view_change(id) != Some(digest) {
            return false;
        }

        self.vcs[id].vc = Some(vc);
        self.vc_cur += 1;

        if primary && (id == self.me || self.quorum.ack_quorum() == 0) {
            if let Some(nv) = self.nv.as_mut() {
                nv.add_view_change(id, digest);
            }
            self.summarize(id, scope);
        }

        if !primary && self.vc_cur == self.vc_target && !self.check_new_view(scope) {
            scope.actions.push(ViewAction::PrimaryFaulty { view: self.view });
        }
        true
    }

    /// Count `ack` towards its view-change.
    ///
    /// Returns false if there is nothing here it could apply to.
    pub fn add_ack(&mut self, ack: &ViewChangeAck, scope: &mut NvScope<'_>) -> bool {
        debug_assert_eq!(ack.view, self.view);
        if self.complete {
            return false;
        }
        let Some(nv) = &self.nv else {
            return false;
        };

        let vci = ack.vc_sender;
        let in_nv = nv.view_change(vci);
        let digest = if self.is_primary() {
            match self.view_change(vci) {
                Some(vc) => vc.digest(),
                None => return false,
            }
        } else {
            match in_nv {
                Some(d) => d,
                None => return false,
            }
        };

        let Some(slot) = self.vcs.get_mut(vci) else {
            return false;
        };
        if in_nv.is_none() && ack.vc_digest == digest && slot.ack_from & bit(ack.sender) == 0 {
            slot.ack_from |= bit(ack.sender);
            slot.ack_count += 1;

            if slot.ack_count == self.quorum.ack_quorum() && self.is_primary() {
                if let Some(nv) = self.nv.as_mut() {
                    nv.add_view_change(vci, digest);
                }
                self.summarize(vci, scope);
            }
        }
        true
    }

    // =========================================================================
    // PRIMARY: SUMMARIZE AND DECIDE
    // =========================================================================

    fn summarize(&mut self, id: ReplicaId, scope: &mut NvScope<'_>) {
        if self.complete {
            return;
        }
        let Some(vc) = self.view_change(id).cloned() else {
            return;
        };

        let was_chosen = self.chosen.is_some();
        let mut matched = false;
        let mut n_le = 0;
        let mut max_seqno = vc.max_seqno();
        let vcn = vc.last_stable;
        let vclc = vc.ckpt(vcn);

        for i in 0..self.ckpts.len() {
            let cur = &mut self.ckpts[i];
            if cur.seqno == vcn && Some(cur.digest) == vclc {
                matched = true;
                cur.n_proofs += 1;
                cur.n_le += 1;
                cur.max_seqno = cur.max_seqno.max(vc.max_seqno());
            } else {
                if vc.ckpt(cur.seqno) == Some(cur.digest) {
                    cur.n_proofs += 1;
                }
                if cur.seqno > vcn {
                    cur.n_le += 1;
                    cur.max_seqno = cur.max_seqno.max(vc.max_seqno());
                } else if cur.seqno < vcn {
                    n_le += 1;
                    max_seqno = max_seqno.max(cur.max_seqno);
                }
            }

            if cur.n_proofs >= self.quorum.weak() && cur.n_le >= self.quorum.quorum() {
                self.choose_ckpt(i, scope);
                if self.complete {
                    return;
                }
            }
        }

        if let (false, Some(digest)) = (matched, vclc) {
            let n_proofs = self
                .vcs
                .iter()
                .enumerate()
                .filter(|(r, slot)| {
                    self.nv.as_ref().and_then(|nv| nv.view_change(*r)).is_some()
                        && slot.vc.as_ref().and_then(|v| v.ckpt(vcn)) == Some(digest)
                })
                .count();
            self.ckpts.push(CheckpointSummary {
                seqno: vcn,
                digest,
                n_proofs,
                n_le: n_le + 1,
                max_seqno,
                proposer: id,
            });
            if n_proofs >= self.quorum.weak() && n_le + 1 >= self.quorum.quorum() {
                self.choose_ckpt(self.ckpts.len() - 1, scope);
            }
        }

        if was_chosen && !self.complete {
            self.summarize_reqs(id, scope);
            scope.actions.push(ViewAction::SendStatus);
        }
    }

    fn choose_ckpt(&mut self, index: usize, scope: &mut NvScope<'_>) {
        debug_assert!(self.is_primary());
        let cur = self.ckpts[index];

        match self.chosen {
            None => {
                self.chosen = Some(index);
                self.range_fixed = true;
                self.min = cur.seqno;
                self.base = cur.seqno + 1;
                self.max = cur.max_seqno + 1;
                let rows = (self.max - self.base) as usize;
                self.reqs = vec![Vec::new(); rows];
                self.comp_reqs = vec![None; rows];

                let in_nv: Vec<ReplicaId> = (0..self.vcs.len())
                    .filter(|r| self.nv.as_ref().and_then(|nv| nv.view_change(*r)).is_some())
                    .collect();
                for r in in_nv {
                    self.summarize_reqs(r, scope);
                    if self.complete {
                        return;
                    }
                }
            }
            Some(chosen) if self.ckpts[chosen].seqno < cur.seqno => {
                let new_max = self.max.min(cur.max_seqno + 1);
                let dropped = (self.min + 1..=cur.seqno).chain(new_max..self.max);
                for n in dropped {
                    if n >= self.base && self.comp_reqs[(n - self.base) as usize].is_some() {
                        self.n_complete -= 1;
                    }
                }
                self.chosen = Some(index);
                self.min = cur.seqno;
                self.max = new_max;
            }
            Some(_) => {}
        }

        if self.n_complete == self.max - self.min - 1 {
            self.complete = true;
            self.make_new_view(scope);
        }
    }

    fn summarize_reqs(&mut self, id: ReplicaId, scope: &mut NvScope<'_>) {
        if self.complete || self.vcs[id].summarized {
            return;
        }
        let Some(vc) = self.view_change(id).cloned() else {
            return;
        };
        self.vcs[id].summarized = true;

        let start = self.min.max(vc.last_stable) + 1;
        for n in start..self.max {
            let idx = (n - self.base) as usize;
            let (rv, rd) = vc.req(n);
            let mut matched = false;
            let mut n_le = 0;

            for j in 0..self.reqs[idx].len() {
                let cur = &mut self.reqs[idx][j];
                if cur.view == rv && cur.digest == rd {
                    matched = true;
                    cur.add_positive(id);
                    cur.n_le += 1;
                } else {
                    count_proofs(cur, &vc, n);
                    if cur.view > rv {
                        cur.n_le += 1;
                    } else if cur.view < rv {
                        n_le += 1;
                    }
                }

                self.check_comp(n, j, scope);
                if self.complete {
                    return;
                }
            }

            if !matched {
                let mut cur = RequestSummary::new(rv, rd, id, n_le + 1);
                for slot in self.vcs.iter().filter(|s| s.summarized) {
                    if let Some(other) = &slot.vc {
                        count_proofs(&mut cur, other, n);
                    }
                }
                self.reqs[idx].push(cur);
                self.check_comp(n, self.reqs[idx].len() - 1, scope);
                if self.complete {
                    return;
                }
            }
        }
    }

    /// Check whether candidate `j` at `seqno` can be carried into the view.
    fn check_comp(&mut self, seqno: Seqno, j: usize, scope: &mut NvScope<'_>) {
        if self.complete {
            return;
        }
        let Some(idx) = self.index(seqno) else {
            return;
        };

        if self.comp_reqs[idx].is_none() {
            let (n, f, view) = (self.quorum.n, self.quorum.f, self.view);
            let quorum = self.quorum;
            let cur = &mut self.reqs[idx][j];
            if cur.is_proven(&quorum) {
                if cur.info.pre_prepare().is_none() {
                    if let Some(logged) = scope.oplog.pre_prepare(seqno, &cur.digest) {
                        cur.info.add(Arc::new(logged.with_view(view)), scope.brt);
                        cur.n_pproofs = n;
                    }
                }
                if cur.n_pproofs <= f && scope.oplog.sent_prepare(seqno, &cur.digest) {
                    cur.n_pproofs = n;
                }

                if cur.view.is_none() || (cur.info.is_complete() && cur.n_pproofs > f) {
                    self.comp_reqs[idx] = Some(j);
                    self.n_complete += 1;
                } else {
                    return;
                }
            }
        }

        if self.n_complete == self.max - self.min - 1 {
            self.complete = true;
            if self.is_primary() {
                self.make_new_view(scope);
            } else {
                self.install_checked(scope);
            }
        }
    }

    /// Highest sequence number known to be stable at some correct replica.
    fn known_stable(&self) -> Seqno {
        let q = self.quorum;
        let stable = kth_largest(
            q.weak(),
            self.vcs.iter().map(|s| s.vc.as_ref().map_or(0, |vc| vc.last_stable)),
        );
        let checkpointed = kth_largest(
            q.quorum(),
            self.vcs
                .iter()
                .map(|s| s.vc.as_ref().and_then(|vc| vc.last_ckpt()).map_or(0, |(n, _)| n)),
        )
        .min(self.min);
        stable.max(checkpointed)
    }

    fn make_new_view(&mut self, scope: &mut NvScope<'_>) {
        debug_assert!(self.complete && self.nv_sent.is_none());
        let Some(chosen) = self.chosen else {
            return;
        };
        let ckpt = self.ckpts[chosen];
        let picks: Vec<(Seqno, ReplicaId)> = (self.min + 1..self.max)
            .filter_map(|n| {
                let idx = (n - self.base) as usize;
                self.comp_reqs[idx].map(|j| (n, self.reqs[idx][j].proposer))
            })
            .collect();
        let known_stable = self.known_stable();

        let Some(nv) = self.nv.as_mut() else {
            return;
        };
        nv.min = self.min;
        nv.pick(ckpt.proposer, self.min);
        for (n, replica) in picks {
            nv.pick(replica, n);
        }
        nv.max = self.max;
        self.nv_sent = Some(scope.now);

        scope.actions.push(ViewAction::InstallNewView {
            min: self.min,
            digest: ckpt.digest,
            max: self.max,
            known_stable,
        });
    }

    // =========================================================================
    // BACKUP: CHECK THE PRIMARY'S DECISION
    // =========================================================================

    fn check_new_view(&mut self, scope: &mut NvScope<'_>) -> bool {
        debug_assert!(!self.is_primary());
        let Some(nv) = self.nv.clone() else {
            return false;
        };
        let Some(cid) = nv.which_picked(nv.min) else {
            return false;
        };
        let Some(vc) = self.view_change(cid).cloned() else {
            return false;
        };

        self.min = vc.last_stable;
        if self.min != nv.min {
            return false;
        }
        self.base = self.min + 1;
        let Some(digest) = vc.ckpt(self.min) else {
            return false;
        };

        let mut n_le = 1;
        let mut n_proofs = 1;
        for (i, slot) in self.vcs.iter().enumerate() {
            let Some(other) = slot.vc.as_ref().filter(|_| i != cid) else {
                continue;
            };
            if other.ckpt(self.min) == Some(digest) {
                n_proofs += 1;
            }
            if other.last_stable <= self.min {
                n_le += 1;
            }
        }
        if n_proofs < self.quorum.weak() || n_le < self.quorum.quorum() {
            return false;
        }

        // Correct if N-f view-changes propose nothing at or above nv.max.
        let n_lt = self
            .vcs
            .iter()
            .filter_map(|s| s.vc.as_ref())
            .filter(|vc| vc.max_seqno() < nv.max)
            .count();
        if n_lt < self.quorum.quorum() {
            return false;
        }

        self.max = nv.max;
        self.range_fixed = true;
        if self.base == self.max {
            self.complete = true;
            let known_stable = self.known_stable();
            scope.actions.push(ViewAction::InstallNewView {
                min: self.min,
                digest,
                max: self.max,
                known_stable,
            });
            return true;
        }

        let rows = (self.max - self.base) as usize;
        self.reqs = vec![Vec::new(); rows];
        self.comp_reqs = vec![None; rows];

        for n in self.base..self.max {
            let Some(vci) = nv.which_picked(n) else {
                return false;
            };
            let Some(picked) = self.view_change(vci).cloned() else {
                return false;
            };
            if n <= picked.last_stable {
                return false;
            }

            let (view, d) = picked.req(n);
            let mut cur = RequestSummary::new(view, d, vci, 0);
            for other in self.vcs.iter().filter_map(|s| s.vc.as_ref()) {
                count_proofs(&mut cur, other, n);
                if other.req(n).0 <= cur.view {
                    cur.n_le += 1;
                }
            }

            if !cur.is_proven(&self.quorum) {
                return false;
            }
            let idx = (n - self.base) as usize;
            self.reqs[idx].push(cur);
            self.check_comp(n, 0, scope);
        }
        true
    }

    fn install_checked(&mut self, scope: &mut NvScope<'_>) {
        let picked = self
            .nv
            .as_ref()
            .map(|nv| (nv.min, nv.max))
            .and_then(|(min, max)| {
                let nv = self.nv.as_ref()?;
                let vc = self.view_change(nv.which_picked(min)?)?;
                Some((vc.last_stable, vc.ckpt(vc.last_stable)?, max))
            });
        if let Some((min, digest, max)) = picked {
            let known_stable = self.known_stable();
            scope.actions.push(ViewAction::InstallNewView {
                min,
                digest,
                max,
                known_stable,
            });
        }
    }

    // =========================================================================
    // USING A COMPLETE NEW-VIEW
    // =========================================================================

    /// Pre-prepare and digest chosen for `seqno`, taking the pre-prepare out.
    ///
    /// Only valid once complete and for `min < seqno < max`.
    pub fn fetch_request(&mut self, seqno: Seqno) -> Option<(Arc<PrePrepare>, Digest)> {
        if !self.complete {
            return None;
        }
        let nv = self.nv.as_ref()?;
        if seqno <= nv.min || seqno >= nv.max {
            return None;
        }
        let vc = self.view_change(nv.which_picked(seqno)?)?;
        let (view, digest) = vc.req(seqno);

        if view.is_some() && !digest.is_zero() {
            let idx = self.index(seqno)?;
            let j = self.comp_reqs[idx]?;
            let info = &mut self.reqs[idx][j].info;
            let pp = info.pre_prepare().cloned()?;
            info.clear();
            Some((pp, digest))
        } else {
            let pp = PrePrepare::null(self.view, seqno);
            let digest = pp.digest();
            Some((Arc::new(pp), digest))
        }
    }

    /// Mark the view-changes `status`'s sender no longer needs.
    pub fn set_received_vcs(&self, status: &mut Status) {
        let Some(nv) = &self.nv else {
            return;
        };
        let primary = self.is_primary();
        for (i, slot) in self.vcs.iter().enumerate() {
            let in_nv = nv.view_change(i).is_some();
            let received = if primary {
                slot.vc.is_some() && in_nv
            } else {
                slot.vc.is_some() || !in_nv
            };
            if received {
                status.mark_vc(i);
            }
        }
    }

    /// Ask for the pre-prepares still needed for a proven value.
    pub fn set_missing_pps(&self, status: &mut Status) {
        if !self.range_fixed {
            return;
        }
        for n in (self.min + 1).max(self.base)..self.max {
            let idx = (n - self.base) as usize;
            if self.comp_reqs[idx].is_some() {
                continue;
            }

            let mut vpp = self.view;
            let mut need_proofs = false;
            let mut big_mask = !0u64;
            for cur in &self.reqs[idx] {
                let Some(view) = cur.view else {
                    continue;
                };
                if view < vpp && cur.is_proven(&self.quorum) {
                    vpp = view;
                    if cur.n_pproofs <= self.quorum.f {
                        need_proofs = true;
                    } else if cur.info.pre_prepare().is_some() {
                        big_mask &= cur.info.missing_reqs();
                    }
                }
            }

            if vpp < self.view {
                status.missing_pps.push(MissingPrePrepare {
                    view: vpp,
                    seqno: n,
                    big_mask,
                    need_proofs,
                });
            }
        }
    }

    /// Offer a pre-prepare a peer sent in response to a missing-pp request.
    pub fn add_missing_pp(&mut self, pp: &PrePrepare, scope: &mut NvScope<'_>) {
        let Some(idx) = self.index(pp.seqno) else {
            return;
        };
        if self.comp_reqs[idx].is_some() {
            return;
        }
        let view = self.view;
        let digest = pp.digest();
        let Some(j) = self.reqs[idx].iter().position(|c| c.digest == digest) else {
            return;
        };
        let cur = &mut self.reqs[idx][j];
        if cur.info.pre_prepare().is_none() && pp.batch.check_digest() {
            cur.info.add(Arc::new(pp.with_view(view)), scope.brt);
            self.check_comp(pp.seqno, j, scope);
        }
    }

    /// An out-of-band body referenced at `index` by the pre-prepare for
    /// `seqno` arrived.
    pub fn add_missing_big(&mut self, digest: &Digest, seqno: Seqno, index: usize, scope: &mut NvScope<'_>) {
        let Some(idx) = self.index(seqno) else {
            return;
        };
        if self.comp_reqs[idx].is_some() {
            return;
        }
        for j in 0..self.reqs[idx].len() {
            self.reqs[idx][j].info.add_missing(digest, index);
            self.check_comp(seqno, j, scope);
            if self.complete {
                break;
            }
        }
    }

    /// Count a prepare sent as a positive proof.
    pub fn add_missing_prepare(&mut self, prepare: &Prepare, scope: &mut NvScope<'_>) {
        let Some(idx) = self.index(prepare.seqno) else {
            return;
        };
        if self.comp_reqs[idx].is_some() {
            return;
        }
        let f = self.quorum.f;
        let Some(j) = self.reqs[idx].iter().position(|c| c.digest == prepare.digest) else {
            return;
        };
        let cur = &mut self.reqs[idx][j];
        if cur.n_pproofs <= f && cur.pproof_from & bit(prepare.sender) == 0 {
            cur.n_pproofs += 1;
            cur.pproof_from |= bit(prepare.sender);
            self.check_comp(prepare.seqno, j, scope);
        }
    }

    /// A checkpoint at `last_stable` became stable.
    ///
    /// A backup whose pending new-view only carries sequence numbers at or
    /// below it can enter the view without the missing pre-prepares.
    pub fn mark_stable(&mut self, last_stable: Seqno, actions: &mut Vec<ViewAction>) {
        if self.view > 0
            && !self.complete
            && self.range_fixed
            && last_stable >= self.max
            && !self.is_primary()
        {
            self.complete = true;
            actions.push(ViewAction::InstallNewView {
                min: last_stable,
                digest: Digest::ZERO,
                max: last_stable,
                known_stable: last_stable,
            });
        }
    }

    /// Drop everything gathered under rotated keys unless complete.
    ///
    /// Returns the local replica's own view-change, except at the new
    /// primary, which restarts assembly from it.
    pub fn mark_stale(&mut self, scope: &mut NvScope<'_>) -> Option<Arc<ViewChange>> {
        if self.complete {
            return None;
        }
        let mine = self.vcs.get_mut(self.me).and_then(|s| s.vc.take());
        let old_view = self.view;
        self.clear();

        if old_view > 0 && self.quorum.primary(old_view) == self.me {
            self.add_new_view(NewView::new(old_view, self.quorum.n, self.me));
            if let Some(vc) = mine {
                self.add_view_change(vc, scope);
            }
            return None;
        }
        mine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::messages::{Batch, ViewChangeEntry};
    use crate::domain::request::Request;

    const D0: Digest = Digest::ZERO;

    fn ckpt_digest() -> Digest {
        Digest::new([5u8; 32])
    }

    fn pp(view: View, seqno: Seqno) -> PrePrepare {
        PrePrepare::new(
            view,
            seqno,
            Batch::new(vec![Request::new(1, 1, b"op".to_vec())], vec![], vec![]),
        )
    }

    fn vc(sender: ReplicaId, entries: Vec<ViewChangeEntry>) -> Arc<ViewChange> {
        let mut vc = ViewChange::new(1, 0, sender);
        vc.checkpoints = vec![(0, ckpt_digest())];
        vc.requests = entries;
        Arc::new(vc)
    }

    fn prepared(seqno: Seqno, digest: Digest) -> ViewChangeEntry {
        ViewChangeEntry {
            seqno,
            view: 0,
            last_view: Some(0),
            digest,
            prepared: true,
        }
    }

    struct Harness {
        oplog: OldRequestLog,
        brt: BigRequestTable,
        actions: Vec<ViewAction>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                oplog: OldRequestLog::new(16, 0, 1),
                brt: BigRequestTable::new(255),
                actions: Vec::new(),
            }
        }

        fn scope(&mut self) -> NvScope<'_> {
            NvScope {
                oplog: &self.oplog,
                brt: &mut self.brt,
                actions: &mut self.actions,
                now: Instant::now(),
            }
        }

        fn installs(&self) -> Vec<(Seqno, Digest, Seqno, Seqno)> {
            self.actions
                .iter()
                .filter_map(|a| match a {
                    ViewAction::InstallNewView {
                        min,
                        digest,
                        max,
                        known_stable,
                    } => Some((*min, *digest, *max, *known_stable)),
                    _ => None,
                })
                .collect()
        }
    }

    fn ack(sender: ReplicaId, vc: &ViewChange) -> ViewChangeAck {
        ViewChangeAck {
            view: 1,
            sender,
            vc_sender: vc.sender,
            vc_digest: vc.digest(),
        }
    }

    #[test]
    fn test_primary_completes_empty_view_change() {
        let q = QuorumParams::new(4);
        let mut h = Harness::new();
        let mut info = NewViewInfo::new(q, 1);
        assert!(info.add_new_view(NewView::new(1, 4, 1)));

        let (v1, v2, v3) = (vc(1, vec![]), vc(2, vec![]), vc(3, vec![]));
        assert!(info.add_view_change(v1, &mut h.scope()));
        assert!(info.add_view_change(Arc::clone(&v2), &mut h.scope()));
        assert!(!info.is_complete());

        // Without acks the primary does not use a peer's view-change.
        assert!(info.add_ack(&ack(3, &v2), &mut h.scope()));
        assert!(!info.is_complete());

        assert!(info.add_view_change(Arc::clone(&v3), &mut h.scope()));
        assert!(info.add_ack(&ack(2, &v3), &mut h.scope()));
        assert!(info.is_complete());
        assert_eq!(h.installs(), vec![(0, ckpt_digest(), 1, 0)]);

        let nv = info.new_view().unwrap();
        assert_eq!((nv.min, nv.max), (0, 1));
        assert!(nv.is_well_formed(4, 16));
        assert!(info.nv_sent().is_some());
    }

    #[test]
    fn test_primary_carries_prepared_value() {
        let q = QuorumParams::new(4);
        let mut h = Harness::new();
        let logged = Arc::new(pp(0, 1));
        h.oplog.add_complete(Arc::clone(&logged), 0);
        let d = logged.digest();

        let mut info = NewViewInfo::new(q, 1);
        info.add_new_view(NewView::new(1, 4, 1));
        let (v1, v2, v3) = (vc(1, vec![prepared(1, d)]), vc(2, vec![prepared(1, d)]), vc(3, vec![]));
        info.add_view_change(v1, &mut h.scope());
        info.add_view_change(Arc::clone(&v2), &mut h.scope());
        info.add_ack(&ack(3, &v2), &mut h.scope());
        info.add_view_change(Arc::clone(&v3), &mut h.scope());
        info.add_ack(&ack(2, &v3), &mut h.scope());

        assert!(info.is_complete());
        assert_eq!(h.installs(), vec![(0, ckpt_digest(), 2, 0)]);
        let (carried, digest) = info.fetch_request(1).unwrap();
        assert_eq!(digest, d);
        assert_eq!(carried.view, 1);
        assert!(Arc::ptr_eq(&carried.batch, &logged.batch));
    }

    fn backup_with_nv(d: Digest) -> (NewViewInfo, Vec<Arc<ViewChange>>) {
        let q = QuorumParams::new(4);
        let vcs = vec![vc(1, vec![prepared(1, d)]), vc(2, vec![prepared(1, d)]), vc(3, vec![])];
        let mut nv = NewView::new(1, 4, 1);
        for v in &vcs {
            nv.add_view_change(v.sender, v.digest());
        }
        nv.min = 0;
        nv.max = 2;
        nv.pick(1, 0);
        nv.pick(1, 1);

        let mut info = NewViewInfo::new(q, 2);
        assert!(info.add_new_view(nv));
        (info, vcs)
    }

    #[test]
    fn test_backup_accepts_correct_new_view() {
        let mut h = Harness::new();
        let logged = Arc::new(pp(0, 1));
        h.oplog.add_complete(Arc::clone(&logged), 0);
        let (mut info, vcs) = backup_with_nv(logged.digest());
        for v in vcs {
            assert!(info.add_view_change(v, &mut h.scope()));
        }
        assert!(info.is_complete());
        assert_eq!(h.installs(), vec![(0, ckpt_digest(), 2, 0)]);
    }

    #[test]
    fn test_backup_fetches_missing_pre_prepare() {
        let mut h = Harness::new();
        let missing = pp(0, 1);
        let (mut info, vcs) = backup_with_nv(missing.digest());
        for v in vcs {
            info.add_view_change(v, &mut h.scope());
        }
        assert!(!info.is_complete());

        let mut status = Status::new(1, 0, 0, 2, false, true);
        info.set_missing_pps(&mut status);
        assert_eq!(status.missing_pps.len(), 1);
        assert_eq!(status.missing_pps[0].seqno, 1);
        assert_eq!(status.missing_pps[0].view, 0);
        assert!(!status.missing_pps[0].need_proofs);

        info.add_missing_pp(&missing, &mut h.scope());
        assert!(info.is_complete());
        assert_eq!(h.installs().len(), 1);
    }

    #[test]
    fn test_backup_rejects_unproven_pick() {
        let mut h = Harness::new();
        let q = QuorumParams::new(4);
        let bogus = pp(0, 1).digest();
        // Only the primary's own view-change proposes seqno 1.
        let vcs = vec![vc(1, vec![prepared(1, bogus)]), vc(2, vec![]), vc(3, vec![])];
        let mut nv = NewView::new(1, 4, 1);
        for v in &vcs {
            nv.add_view_change(v.sender, v.digest());
        }
        nv.max = 2;
        nv.pick(1, 0);
        nv.pick(1, 1);

        let mut info = NewViewInfo::new(q, 2);
        info.add_new_view(nv);
        for v in vcs {
            info.add_view_change(v, &mut h.scope());
        }
        assert!(!info.is_complete());
        assert!(h
            .actions
            .iter()
            .any(|a| matches!(a, ViewAction::PrimaryFaulty { view: 1 })));
    }

    #[test]
    fn test_backup_ignores_unreferenced_view_change() {
        let mut h = Harness::new();
        let (mut info, _) = backup_with_nv(pp(0, 1).digest());
        let stranger = vc(0, vec![]);
        assert!(!info.add_view_change(stranger, &mut h.scope()));
    }

    #[test]
    fn test_stable_checkpoint_shortcut() {
        let mut h = Harness::new();
        let (mut info, vcs) = backup_with_nv(pp(0, 1).digest());
        for v in vcs {
            info.add_view_change(v, &mut h.scope());
        }
        assert!(!info.is_complete());
        info.mark_stable(2, &mut h.actions);
        assert!(info.is_complete());
        assert_eq!(h.installs(), vec![(2, D0, 2, 2)]);
    }

    fn pre_prepared_only(sender: ReplicaId, seqno: Seqno) -> Arc<ViewChange> {
        let mut raw = ViewChange::new(1, 0, sender);
        raw.checkpoints = vec![(0, ckpt_digest())];
        raw.requests = vec![ViewChangeEntry {
            seqno,
            view: 0,
            last_view: None,
            digest: pp(0, seqno).digest(),
            prepared: false,
        }];
        Arc::new(raw)
    }

    #[test]
    fn test_null_fetch_for_unproposed_seqno() {
        let q = QuorumParams::new(4);
        let mut h = Harness::new();
        let mut info = NewViewInfo::new(q, 1);
        info.add_new_view(NewView::new(1, 4, 1));

        // Replica 2 pre-prepared seqno 2 but it never prepared anywhere.
        let v2 = pre_prepared_only(2, 2);
        let (v1, v3) = (vc(1, vec![]), vc(3, vec![]));

        info.add_view_change(v1, &mut h.scope());
        info.add_view_change(Arc::clone(&v2), &mut h.scope());
        info.add_ack(&ack(3, &v2), &mut h.scope());
        assert!(!info.is_complete());
        info.add_view_change(Arc::clone(&v3), &mut h.scope());
        info.add_ack(&ack(2, &v3), &mut h.scope());

        // N-f view-changes without a prepared value settle seqno 2 on null.
        assert!(info.is_complete());
        assert_eq!(h.installs(), vec![(0, ckpt_digest(), 3, 0)]);
        assert_eq!(info.new_view().map(|nv| nv.max), Some(3));
        for n in 1..3 {
            let (null, digest) = info.fetch_request(n).unwrap();
            assert!(null.batch.is_empty());
            assert_eq!(null.view, 1);
            assert_eq!(digest, Batch::empty().digest());
        }
    }

    #[test]
    fn test_new_primary_with_unprepared_pre_prepare_picks_null() {
        let q = QuorumParams::new(4);
        let mut h = Harness::new();
        // The new primary itself is the only replica that saw seqno 1.
        h.oplog.add_incomplete(1, pp(0, 1).digest(), 0);
        let mut info = NewViewInfo::new(q, 1);
        info.add_new_view(NewView::new(1, 4, 1));

        let (v1, v2, v3) = (pre_prepared_only(1, 1), vc(2, vec![]), vc(3, vec![]));
        info.add_view_change(v1, &mut h.scope());
        info.add_view_change(Arc::clone(&v2), &mut h.scope());
        info.add_ack(&ack(3, &v2), &mut h.scope());
        info.add_view_change(Arc::clone(&v3), &mut h.scope());
        info.add_ack(&ack(2, &v3), &mut h.scope());

        assert!(info.is_complete());
        let (null, digest) = info.fetch_request(1).unwrap();
        assert!(null.batch.is_empty());
        assert_eq!(digest, Batch::empty().digest());
    }

    #[test]
    fn test_backup_accepts_null_over_unprepared_pre_prepare() {
        let mut h = Harness::new();
        let vcs = vec![pre_prepared_only(1, 1), vc(2, vec![]), vc(3, vec![])];
        let mut nv = NewView::new(1, 4, 1);
        for v in &vcs {
            nv.add_view_change(v.sender, v.digest());
        }
        nv.min = 0;
        nv.max = 2;
        nv.pick(1, 0);
        nv.pick(2, 1);

        let mut info = NewViewInfo::new(QuorumParams::new(4), 3);
        assert!(info.add_new_view(nv));
        for v in vcs {
            assert!(info.add_view_change(v, &mut h.scope()));
        }
        assert!(info.is_complete());
        assert_eq!(h.installs(), vec![(0, ckpt_digest(), 2, 0)]);
        assert!(!h
            .actions
            .iter()
            .any(|a| matches!(a, ViewAction::PrimaryFaulty { .. })));
    }

    #[test]
    fn test_mark_stale_keeps_own_view_change() {
        let mut h = Harness::new();
        let (mut info, vcs) = backup_with_nv(pp(0, 1).digest());
        let mine = Arc::clone(&vcs[1]);
        info.add_view_change(Arc::clone(&mine), &mut h.scope());
        let returned = info.mark_stale(&mut h.scope());
        assert_eq!(returned.map(|v| v.sender), Some(2));
        assert_eq!(info.view(), 0);
    }
}
