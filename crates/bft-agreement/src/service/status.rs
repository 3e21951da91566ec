//! Status exchange, retransmission and session-key rotation.

use super::Replica;
use crate::domain::{Destination, NewKey, PrePrepare, Status, WireMessage};
use crate::metrics;
use crate::ports::{Application, CryptoService, StateSync, Transport};
use bft_telemetry::log_replica_event;
use shared_types::ReplicaId;

impl<T, C, S, A> Replica<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    // =========================================================================
    // STATUS
    // =========================================================================

    /// Broadcast what this replica has, at most once per `status_min_interval`.
    pub(super) fn send_status(&mut self) {
        let now = self.now();
        if let Some(last) = self.last_status {
            if now.saturating_duration_since(last) < self.config.status_min_interval {
                return;
            }
        }
        self.last_status = Some(now);

        let has_new_view = self.has_new_view();
        let mut status = Status::new(
            self.view,
            self.last_stable,
            self.last_executed,
            self.id,
            has_new_view,
            self.vi.new_view(self.view).is_some(),
        );

        if has_new_view {
            let in_check = self.state.in_check();
            let first = self.last_executed.max(self.last_stable) + 1;
            for n in first..=self.max_window() {
                let Some(pc) = self.plog.get(n) else {
                    continue;
                };
                if pc.is_complete() || in_check {
                    status.mark_prepared(n);
                    let committed = self.clog.get(n).map_or(false, |cc| cc.is_complete());
                    if committed || in_check {
                        status.mark_committed(n);
                    }
                } else if !pc.is_pp_complete()
                    && pc.pre_prepare().is_some()
                    && pc.num_correct() >= self.quorum.f
                {
                    status.big_requests.push((n, pc.missing_reqs()));
                }
            }
        } else {
            self.vi.set_received_vcs(&mut status);
            self.vi.set_missing_pps(&mut status);
        }

        metrics::record_status_sent();
        self.send(Destination::AllReplicas, WireMessage::Status(status));
    }

    /// Retransmit whatever `status`'s sender is missing.
    pub(super) fn handle_status(&mut self, status: Status) {
        let max_out = self.config.max_out;
        if !status.is_well_formed(max_out) {
            self.drop_message("malformed_status", &WireMessage::Status(status));
            return;
        }
        let to = status.sender;
        let dest = Destination::Replica(to);

        if self.last_stable > status.last_stable + max_out {
            // Too far behind to use anything in the log.
            if let Some(checkpoint) = self.my_stable_checkpoint() {
                self.send(dest, WireMessage::Checkpoint(checkpoint));
            }
            return;
        }

        let max = self.last_stable.min(status.last_stable) + max_out;
        let min = self.last_stable.max(status.last_stable + 1);
        let interval = self.config.checkpoint_interval;
        for n in (min..=max).filter(|n| n % interval == 0) {
            let checkpoint = if n == self.last_stable {
                self.my_stable_checkpoint()
            } else {
                self.elog.get(n).and_then(|cert| cert.mine().cloned())
            };
            if let Some(checkpoint) = checkpoint {
                self.send(dest, WireMessage::Checkpoint(checkpoint));
            }
        }

        if status.view < self.view {
            if let Some((vc, _)) = self.vi.my_view_change() {
                let vc = (**vc).clone();
                self.send(dest, WireMessage::ViewChange(vc));
            }
            return;
        }
        if status.view > self.view {
            return;
        }

        if status.has_new_view {
            self.retransmit_ordering(&status, max);
        } else {
            self.retransmit_view_change(&status);
        }
    }

    /// Commits, prepares and pre-prepares the sender lacks in this view.
    fn retransmit_ordering(&mut self, status: &Status, max: u64) {
        let dest = Destination::Replica(status.sender);
        let primary = self.is_primary();
        let first = (self.last_stable + 1).max(status.last_executed.saturating_add(1));
        for n in first..=max {
            if status.is_committed(n) {
                continue;
            }
            if let Some(commit) = self.clog.get(n).and_then(|cc| cc.mine().cloned()) {
                self.send(dest, WireMessage::Commit(commit));
            }
            if status.is_prepared(n) {
                continue;
            }
            let Some(pc) = self.plog.get(n) else {
                continue;
            };
            if primary {
                if let Some(pp) = pc.my_pre_prepare() {
                    let pp = (**pp).clone();
                    self.send(dest, WireMessage::PrePrepare(pp));
                }
            } else if let Some(prepare) = pc.my_prepare() {
                let prepare = prepare.clone();
                self.send(dest, WireMessage::Prepare(prepare));
            }
        }

        // Only the primary relays request bodies.
        if primary {
            for &(n, mask) in &status.big_requests {
                let pp = self.plog.get(n).and_then(|pc| pc.pre_prepare().cloned());
                if let Some(pp) = pp {
                    self.send_big_bodies(&pp, mask, status.sender);
                }
            }
        }
    }

    /// View-changes, acks and pre-prepares the sender needs to finish the
    /// view change.
    fn retransmit_view_change(&mut self, status: &Status) {
        let to = status.sender;
        let dest = Destination::Replica(to);
        let primary = self.is_primary();

        if !status.has_vc(self.id) {
            if let Some((vc, _)) = self.vi.my_view_change() {
                let vc = (**vc).clone();
                self.send(dest, WireMessage::ViewChange(vc));
            }
        }

        if !status.has_nv_message {
            if primary && self.vi.has_new_view(self.view) {
                if let Some((nv, _)) = self.vi.my_new_view() {
                    let nv = nv.clone();
                    self.send(dest, WireMessage::NewView(nv));
                }
            }
            return;
        }

        if !primary {
            let acks: Vec<_> = (0..self.quorum.n)
                .filter(|&i| i != to && !status.has_vc(i))
                .filter_map(|i| self.vi.my_ack(i).cloned())
                .collect();
            for ack in acks {
                self.send(dest, WireMessage::ViewChangeAck(ack));
            }
        }

        let mut actions = Vec::new();
        for missing in &status.missing_pps {
            let pp = if to == self.primary() {
                self.vi
                    .pre_prepare_since(missing.seqno, missing.view)
                    .cloned()
            } else if primary {
                self.plog.get(missing.seqno).and_then(|pc| pc.pre_prepare().cloned())
            } else {
                None
            };
            if let Some(pp) = pp {
                self.send(dest, WireMessage::PrePrepare((*pp).clone()));
                if missing.big_mask != !0 {
                    self.send_big_bodies(&pp, missing.big_mask, to);
                }
            }
            if missing.need_proofs {
                self.vi
                    .send_proofs(missing.seqno, missing.view, to, &mut actions);
            }
        }
        self.apply_view_actions(actions);
    }

    /// Send the out-of-band bodies of `pp` whose bit is set in `mask`.
    fn send_big_bodies(&self, pp: &PrePrepare, mask: u64, to: ReplicaId) {
        for (i, digest) in pp.big_requests().iter().enumerate() {
            if i >= 64 || mask & (1 << i) == 0 {
                continue;
            }
            if let Some(request) = self.brt.lookup(digest) {
                self.send(Destination::Replica(to), WireMessage::Request(request.clone()));
            }
        }
    }

    // =========================================================================
    // SESSION KEYS
    // =========================================================================

    /// Rotate inbound session keys and announce the new epoch.
    ///
    /// State authenticated under the old keys that is not yet complete is
    /// discarded so peers re-send it.
    pub(super) fn send_new_key(&mut self) {
        let epoch = self.crypto.rotate_keys();
        let key = NewKey {
            sender: self.id,
            epoch,
        };
        self.send(Destination::AllReplicas, WireMessage::NewKey(key.clone()));
        self.last_new_key = Some(key);
        log_replica_event!(info, self.id, self.view, "[bft] rotated session keys", epoch = epoch);

        let interval = self.config.checkpoint_interval;
        for n in (self.last_stable + 1..=self.max_window()).filter(|n| n % interval == 0) {
            if let Some(cert) = self.elog.get_mut(n) {
                cert.mark_stale();
            }
        }
        for n in self.last_stable.max(self.last_executed) + 1..=self.max_window() {
            if let Some(pc) = self.plog.get_mut(n) {
                pc.mark_stale();
            }
            if let Some(cc) = self.clog.get_mut(n) {
                cc.mark_stale();
            }
        }
        self.with_view_info(|vi, ctx| vi.mark_stale(ctx));
        self.state.mark_stale();
    }

    pub(super) fn handle_new_key(&mut self, key: NewKey) {
        if !self.crypto.accept_key_epoch(key.sender, key.epoch) {
            log_replica_event!(
                debug,
                self.id,
                self.view,
                "[bft] ignored stale key announcement",
                sender = key.sender,
                epoch = key.epoch
            );
        }
    }
}
