//! View-change coordinator.
//!
//! Holds the log of what the local replica proposed or prepared in earlier
//! views, the latest view-change each peer sent, the acknowledgements the
//! new primary buffers, and one [`NewViewInfo`] per possible primary.
//!
//! Nothing here talks to the network or the replica directly. Every call
//! appends [`ViewAction`]s to the caller's list and the replica carries them
//! out once the call returns.

use super::big_req_table::BigRequestTable;
use super::messages::{
    NewView, PrePrepare, Prepare, Status, ViewChange, ViewChangeAck, ViewChangeEntry,
};
use super::nv_info::{NewViewInfo, NvScope};
use super::old_requests::{OldRequestLog, PersistedOldRequest};
use super::quorum::{kth_largest, QuorumParams};
use super::wire::{Destination, WireMessage};
use shared_types::{Digest, ReplicaId, Seqno, View};
use std::sync::Arc;
use std::time::Instant;

/// Work the replica must do on behalf of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewAction {
    /// Send `message` to `to`.
    Send {
        to: Destination,
        message: WireMessage,
    },
    /// Broadcast a status message now.
    SendStatus,
    /// The new-view for the current view is complete: the checkpoint `min`
    /// with `digest` is chosen, values for `(min, max)` can be fetched, and
    /// `known_stable` is stable at some correct replica.
    InstallNewView {
        min: Seqno,
        digest: Digest,
        max: Seqno,
        known_stable: Seqno,
    },
    /// The primary of `view` sent a new-view its own view-changes refute.
    PrimaryFaulty { view: View },
}

/// Borrowed replica state a coordinator call may use.
pub struct ViewContext<'a> {
    pub brt: &'a mut BigRequestTable,
    pub actions: &'a mut Vec<ViewAction>,
    pub now: Instant,
}

#[derive(Debug, Clone)]
struct AckBuffer {
    view: View,
    acks: Vec<Option<ViewChangeAck>>,
}

impl AckBuffer {
    fn new(n: usize) -> Self {
        Self {
            view: 0,
            acks: vec![None; n],
        }
    }

    fn clear(&mut self) {
        self.view = 0;
        for ack in &mut self.acks {
            *ack = None;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewInfo {
    quorum: QuorumParams,
    me: ReplicaId,
    view: View,
    last_stable: Seqno,
    oplog: OldRequestLog,
    /// Highest view each replica is known to have moved to.
    last_views: Vec<View>,
    /// View-changes not yet matched with a new-view.
    last_vcs: Vec<Option<Arc<ViewChange>>>,
    /// Acks this replica sent, kept for retransmission.
    my_acks: Vec<Option<ViewChangeAck>>,
    /// Acks buffered at the new primary, by ack sender.
    acks: Vec<AckBuffer>,
    /// New-view state, by the primary that sends it.
    last_nvs: Vec<NewViewInfo>,
    vc_sent: Option<Instant>,
}

macro_rules! scope {
    ($self:ident, $ctx:ident) => {
        NvScope {
            oplog: &$self.oplog,
            brt: &mut *$ctx.brt,
            actions: &mut *$ctx.actions,
            now: $ctx.now,
        }
    };
}

impl ViewInfo {
    pub fn new(quorum: QuorumParams, me: ReplicaId, max_out: u64) -> Self {
        let n = quorum.n;
        Self {
            quorum,
            me,
            view: 0,
            last_stable: 0,
            oplog: OldRequestLog::new(max_out, 0, quorum.f),
            last_views: vec![0; n],
            last_vcs: vec![None; n],
            my_acks: vec![None; n],
            acks: vec![AckBuffer::new(n); n],
            last_nvs: vec![NewViewInfo::new(quorum, me); n],
            vc_sent: None,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// True once the replica may act in `view`.
    pub fn has_new_view(&self, view: View) -> bool {
        if view == 0 {
            return true;
        }
        let nvi = &self.last_nvs[self.quorum.primary(view)];
        nvi.view() == view && nvi.is_complete()
    }

    /// Restore the "complete" flag of the current view after a restart.
    pub fn make_complete(&mut self, view: View) {
        self.last_nvs[self.quorum.primary(view)].make_complete(view);
    }

    // =========================================================================
    // OLD REQUEST LOG
    // =========================================================================

    /// Record a pre-prepare that prepared in the view being left.
    pub fn add_complete(&mut self, pp: Arc<PrePrepare>) {
        self.oplog.add_complete(pp, self.view);
    }

    /// Record a value pre-prepared in the view being left without preparing.
    pub fn add_incomplete(&mut self, seqno: Seqno, digest: Digest) {
        self.oplog.add_incomplete(seqno, digest, self.view);
    }

    /// Resend prepares for older digests at `seqno` from `view` onwards to
    /// `dest`, proving them for its new-view check.
    pub fn send_proofs(&self, seqno: Seqno, view: View, dest: ReplicaId, actions: &mut Vec<ViewAction>) {
        for (v, digest) in self.oplog.proofs(seqno, view) {
            let mut prepare = Prepare::new(v, seqno, digest, self.me);
            prepare.proof = true;
            actions.push(ViewAction::Send {
                to: Destination::Replica(dest),
                message: WireMessage::Prepare(prepare),
            });
        }
    }

    pub fn pre_prepare(&self, seqno: Seqno, digest: &Digest) -> Option<&Arc<PrePrepare>> {
        self.oplog.pre_prepare(seqno, digest)
    }

    pub fn pre_prepare_since(&self, seqno: Seqno, view: View) -> Option<&Arc<PrePrepare>> {
        self.oplog.pre_prepare_since(seqno, view)
    }

    // =========================================================================
    // VIEW CHANGE
    // =========================================================================

    fn discard_old(&mut self) {
        let view = self.view;
        for i in 0..self.quorum.n {
            if self.last_vcs[i].as_ref().map_or(false, |vc| vc.view < view) {
                self.last_vcs[i] = None;
            }
            self.my_acks[i] = None;
            if self.acks[i].view < view {
                self.acks[i].clear();
                self.acks[i].view = view;
            }
            if self.last_nvs[i].view() < view {
                self.last_nvs[i].clear();
            }
        }
    }

    /// Move to `view` and broadcast this replica's view-change.
    ///
    /// `checkpoints` are the digests of checkpoints from the last stable one
    /// up to the last executed sequence number.
    pub fn view_change(&mut self, view: View, checkpoints: Vec<(Seqno, Digest)>, ctx: &mut ViewContext<'_>) {
        self.view = view;
        self.discard_old();

        let mut vc = ViewChange::new(view, self.last_stable, self.me);
        vc.checkpoints = checkpoints;
        for (seqno, info) in self.oplog.entries() {
            let Some(entry_view) = info.view else {
                continue;
            };
            vc.requests.push(ViewChangeEntry {
                seqno,
                view: entry_view,
                last_view: info.last_view,
                digest: info.digest,
                prepared: info.pre_prepare.is_some(),
            });
            // Keep bodies referenced by logged pre-prepares.
            if let Some(pp) = &info.pre_prepare {
                for (j, d) in pp.big_requests().iter().enumerate() {
                    ctx.brt.add_pre_prepare(*d, j, seqno, view);
                }
            }
        }
        ctx.brt.view_change(view);

        self.vc_sent = Some(ctx.now);
        ctx.actions.push(ViewAction::Send {
            to: Destination::AllReplicas,
            message: WireMessage::ViewChange(vc.clone()),
        });
        let vc = Arc::new(vc);
        self.last_vcs[self.me] = Some(Arc::clone(&vc));
        self.last_views[self.me] = view;

        let primary = self.quorum.primary(view);
        if primary != self.me {
            for i in 0..self.quorum.n {
                let Some(lvc) = &self.last_vcs[i] else {
                    continue;
                };
                if lvc.view == view && i != self.me && i != primary {
                    let ack = ViewChangeAck {
                        view,
                        sender: self.me,
                        vc_sender: i,
                        vc_digest: lvc.digest(),
                    };
                    self.my_acks[i] = Some(ack.clone());
                    ctx.actions.push(ViewAction::Send {
                        to: Destination::Replica(primary),
                        message: WireMessage::ViewChangeAck(ack),
                    });
                }
            }
        } else {
            let me = self.me;
            self.last_nvs[me].add_new_view(NewView::new(view, self.quorum.n, me));

            for i in 0..self.quorum.n {
                let Some(held) = self.last_vcs[i].clone().filter(|v| v.view == view) else {
                    continue;
                };
                if self.last_nvs[me].add_view_change(held, &mut scope!(self, ctx)) {
                    self.last_vcs[i] = None;
                }
            }

            for i in 0..self.quorum.n {
                if self.acks[i].view != view {
                    continue;
                }
                for j in 0..self.quorum.n {
                    let Some(ack) = self.acks[i].acks[j].clone() else {
                        continue;
                    };
                    if self.last_nvs[me].add_ack(&ack, &mut scope!(self, ctx)) {
                        self.acks[i].acks[j] = None;
                    }
                }
            }
        }
    }

    /// Store a view-change from a peer. Returns true if it was kept.
    pub fn add_view_change(&mut self, vc: ViewChange, ctx: &mut ViewContext<'_>) -> bool {
        let vci = vc.sender;
        let vcv = vc.view;
        if vcv < self.view || vci >= self.quorum.n {
            return false;
        }

        let vc = Arc::new(vc);
        let nv_owner = self.quorum.primary(vcv);
        let primary = self.quorum.primary(self.view);

        if self.last_nvs[nv_owner].view() == vcv {
            let stored = self.last_nvs[nv_owner].add_view_change(Arc::clone(&vc), &mut scope!(self, ctx));
            if stored && self.me == primary && vcv == self.view {
                for i in 0..self.quorum.n {
                    if self.acks[i].view != self.view {
                        continue;
                    }
                    if let Some(ack) = self.acks[i].acks[vci].take() {
                        self.last_nvs[nv_owner].add_ack(&ack, &mut scope!(self, ctx));
                    }
                }
            }
            if vcv > self.last_views[vci] {
                self.last_views[vci] = vcv;
            }
            return stored;
        }

        if vcv <= self.last_views[vci] {
            return false;
        }
        let digest = vc.digest();
        self.last_vcs[vci] = Some(vc);
        self.last_views[vci] = vcv;

        if self.me != primary && vci != primary && vcv == self.view {
            let ack = ViewChangeAck {
                view: self.view,
                sender: self.me,
                vc_sender: vci,
                vc_digest: digest,
            };
            self.my_acks[vci] = Some(ack.clone());
            ctx.actions.push(ViewAction::Send {
                to: Destination::Replica(primary),
                message: WireMessage::ViewChangeAck(ack),
            });
        }
        true
    }

    /// Store a new-view from the primary of its view.
    pub fn add_new_view(&mut self, nv: NewView, ctx: &mut ViewContext<'_>) -> bool {
        let nvv = nv.view;
        let sender = nv.sender;
        if nvv < self.view || sender >= self.quorum.n || self.quorum.primary(nvv) != sender {
            return false;
        }
        if nvv <= self.last_nvs[sender].view() || !self.last_nvs[sender].add_new_view(nv) {
            return false;
        }

        for i in 0..self.quorum.n {
            let Some(held) = self.last_vcs[i].clone().filter(|v| v.view == nvv) else {
                continue;
            };
            if self.last_nvs[sender].add_view_change(held, &mut scope!(self, ctx)) {
                self.last_vcs[i] = None;
            }
        }
        true
    }

    /// Handle an acknowledgement sent to the new primary.
    pub fn add_ack(&mut self, ack: ViewChangeAck, ctx: &mut ViewContext<'_>) {
        let n = self.quorum.n;
        if ack.sender >= n || ack.vc_sender >= n {
            return;
        }
        let owner = self.quorum.primary(ack.view);
        if self.last_nvs[owner].view() == ack.view
            && self.last_nvs[owner].add_ack(&ack, &mut scope!(self, ctx))
        {
            return;
        }

        if self.me == owner {
            let buffer = &mut self.acks[ack.sender];
            if buffer.view <= ack.view {
                if buffer.view < ack.view {
                    buffer.clear();
                }
                buffer.view = ack.view;
                let vci = ack.vc_sender;
                buffer.acks[vci] = Some(ack);
            }
        }
    }

    /// Lowest view that at least f+1 replicas moved to.
    pub fn max_view(&self) -> View {
        kth_largest(self.quorum.weak(), self.last_views.iter().copied())
    }

    /// Lowest view that at least N-f replicas moved to.
    pub fn max_maj_view(&self) -> View {
        kth_largest(self.quorum.quorum(), self.last_views.iter().copied())
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    pub fn set_received_vcs(&self, status: &mut Status) {
        debug_assert_eq!(status.view, self.view);
        let nvi = &self.last_nvs[self.quorum.primary(self.view)];
        if nvi.view() == self.view {
            nvi.set_received_vcs(status);
        } else {
            for (i, vc) in self.last_vcs.iter().enumerate() {
                if vc.as_ref().map_or(false, |vc| vc.view == self.view) {
                    status.mark_vc(i);
                }
            }
        }
    }

    pub fn set_missing_pps(&self, status: &mut Status) {
        let nvi = &self.last_nvs[self.quorum.primary(self.view)];
        if nvi.new_view().is_some() {
            nvi.set_missing_pps(status);
        }
    }

    /// This replica's view-change for the current view and when it was sent.
    pub fn my_view_change(&self) -> Option<(&Arc<ViewChange>, Option<Instant>)> {
        let mine = match &self.last_vcs[self.me] {
            Some(vc) => Some(vc),
            None => self.last_nvs[self.quorum.primary(self.view)].view_change(self.me),
        };
        mine.map(|vc| (vc, self.vc_sent))
    }

    /// The new-view this replica produced as primary, and when.
    pub fn my_new_view(&self) -> Option<(&NewView, Option<Instant>)> {
        let nvi = &self.last_nvs[self.me];
        nvi.new_view().map(|nv| (nv, nvi.nv_sent()))
    }

    /// New-view received for `view`, if any.
    pub fn new_view(&self, view: View) -> Option<&NewView> {
        let nvi = &self.last_nvs[self.quorum.primary(view)];
        nvi.new_view().filter(|nv| nv.view == view)
    }

    /// The view-change from `replica` this replica holds for `view`.
    pub fn view_change_from(&self, replica: ReplicaId, view: View) -> Option<&Arc<ViewChange>> {
        let held = self.last_vcs.get(replica)?.as_ref().filter(|vc| vc.view == view);
        held.or_else(|| {
            let nvi = &self.last_nvs[self.quorum.primary(view)];
            if nvi.view() == view {
                nvi.view_change(replica)
            } else {
                None
            }
        })
    }

    /// The ack this replica sent for `vc_sender`'s view-change.
    pub fn my_ack(&self, vc_sender: ReplicaId) -> Option<&ViewChangeAck> {
        self.my_acks.get(vc_sender).and_then(Option::as_ref)
    }

    // =========================================================================
    // NEW-VIEW COMPLETION
    // =========================================================================

    /// Pre-prepare chosen for `seqno` by the complete new-view.
    pub fn fetch_request(&mut self, seqno: Seqno) -> Option<(Arc<PrePrepare>, Digest)> {
        self.last_nvs[self.quorum.primary(self.view)].fetch_request(seqno)
    }

    pub fn add_missing_pp(&mut self, pp: &PrePrepare, ctx: &mut ViewContext<'_>) {
        let p = self.quorum.primary(self.view);
        self.last_nvs[p].add_missing_pp(pp, &mut scope!(self, ctx));
    }

    pub fn add_missing_big(&mut self, digest: &Digest, seqno: Seqno, index: usize, ctx: &mut ViewContext<'_>) {
        let p = self.quorum.primary(self.view);
        self.last_nvs[p].add_missing_big(digest, seqno, index, &mut scope!(self, ctx));
    }

    pub fn add_missing_prepare(&mut self, prepare: &Prepare, ctx: &mut ViewContext<'_>) {
        let p = self.quorum.primary(self.view);
        self.last_nvs[p].add_missing_prepare(prepare, &mut scope!(self, ctx));
    }

    // =========================================================================
    // CHECKPOINTS AND KEYS
    // =========================================================================

    pub fn mark_stable(&mut self, last_stable: Seqno, actions: &mut Vec<ViewAction>) {
        self.last_stable = last_stable;
        self.oplog.truncate(last_stable);
        let p = self.quorum.primary(self.view);
        self.last_nvs[p].mark_stable(last_stable, actions);
    }

    /// Forget all view-change state above `last_stable`.
    pub fn clear(&mut self) {
        self.oplog.reset(self.last_stable);
        let view = self.view;
        for i in 0..self.quorum.n {
            self.last_vcs[i] = None;
            self.last_views[i] = view;
            self.acks[i].clear();
            self.my_acks[i] = None;
            self.last_nvs[i].clear();
        }
        self.vc_sent = None;
    }

    /// Drop messages authenticated under keys that were just rotated,
    /// keeping this replica's own view-change.
    pub fn mark_stale(&mut self, ctx: &mut ViewContext<'_>) {
        let view = self.view;
        for i in 0..self.quorum.n {
            if i != self.me {
                self.last_vcs[i] = None;
                self.last_views[i] = self.last_views[i].min(view);
            }
            self.my_acks[i] = None;

            let mine = self.last_nvs[i].mark_stale(&mut scope!(self, ctx));
            if let Some(vc) = mine.filter(|vc| vc.view == view) {
                self.last_vcs[self.me] = Some(vc);
            }
            self.acks[i].clear();
        }
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    pub fn export(&self) -> Vec<PersistedOldRequest> {
        self.oplog.export()
    }

    /// Reset to `view` with window base `last_stable` and reload the log.
    ///
    /// Returns false, leaving the log empty, if any entry is inconsistent.
    pub fn restore(&mut self, view: View, last_stable: Seqno, entries: Vec<PersistedOldRequest>) -> bool {
        self.view = view;
        self.last_stable = last_stable;
        self.clear();
        for entry in entries {
            if !self.oplog.import(entry) {
                self.oplog.reset(last_stable);
                return false;
            }
        }
        true
    }
}
