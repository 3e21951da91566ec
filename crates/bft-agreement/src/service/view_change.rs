//! Leaving a view and installing the next one.

use super::Replica;
use crate::domain::{
    Destination, NewView, Prepare, ViewChange, ViewChangeAck, ViewContext, WireMessage,
};
use crate::events::ReplicaEvent;
use crate::metrics;
use crate::ports::{Application, CryptoService, StateSync, Transport};
use bft_telemetry::log_replica_event;
use shared_types::{Digest, Seqno};

impl<T, C, S, A> Replica<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    /// The view-change timer expired without progress.
    pub(super) fn on_view_change_timeout(&mut self) {
        if self.state.in_fetch() {
            // Fetching is progress; give it another period.
            let now = self.now();
            self.vtimer.restart(now);
            return;
        }
        log_replica_event!(
            warn,
            self.id,
            self.view,
            "[bft] view-change timer expired",
            period_ms = self.vtimer.period().as_millis() as u64
        );
        self.send_view_change();
    }

    /// Move to the next view and broadcast this replica's view-change.
    pub(super) fn send_view_change(&mut self) {
        self.view += 1;
        self.limbo = true;
        self.vtimer.stop();
        if self.vc_since_nv {
            // Consecutive view-changes without a new view wait longer each time.
            self.vtimer.backoff();
        }
        self.vc_since_nv = true;

        if self.last_tentative_execute > self.last_executed {
            self.rollback();
        }
        self.last_prepared = self.last_executed;

        let first = self.last_stable + 1;
        let last = self.max_window();
        for n in first..=last {
            if let Some(pc) = self.plog.get_mut(n) {
                if pc.is_complete() {
                    if let Some(pp) = pc.take_pre_prepare() {
                        self.vi.add_complete(pp);
                    }
                } else if let Some(prepare) = pc.my_prepare() {
                    self.vi.add_incomplete(n, prepare.digest);
                } else if let Some(pp) = pc.my_pre_prepare() {
                    self.vi.add_incomplete(n, pp.digest());
                }
                pc.clear();
            }
            if let Some(cc) = self.clog.get_mut(n) {
                cc.clear();
            }
        }

        let interval = self.config.checkpoint_interval;
        let checkpoints: Vec<(Seqno, Digest)> = (self.last_stable..=self.last_executed)
            .filter(|n| n % interval == 0)
            .filter_map(|n| self.state.digest(n).map(|digest| (n, digest)))
            .collect();

        let view = self.view;
        log_replica_event!(
            info,
            self.id,
            view,
            "[bft] sending view-change",
            last_stable = self.last_stable,
            last_executed = self.last_executed,
            checkpoints = checkpoints.len()
        );
        metrics::record_view_change(view);
        self.record_event(ReplicaEvent::ViewChangeStarted { view });

        self.with_view_info(|vi, ctx| vi.view_change(view, checkpoints, ctx));
    }

    pub(super) fn handle_view_change(&mut self, vc: ViewChange) {
        if !vc.is_well_formed(self.config.max_out) {
            self.drop_message("malformed_view_change", &WireMessage::ViewChange(vc));
            return;
        }

        // The primary itself gave up on its view.
        if vc.sender == self.primary() && vc.view > self.view {
            self.send_view_change();
        }

        let sender = vc.sender;
        let vc_view = vc.view;
        // Actions are applied after any view move below, so a new-view that
        // completes for a later view installs once this replica is in it.
        let mut actions = Vec::new();
        let modified = {
            let now = self.now();
            let mut ctx = ViewContext {
                brt: &mut self.brt,
                actions: &mut actions,
                now,
            };
            self.vi.add_view_change(vc, &mut ctx)
        };

        if !modified {
            self.apply_view_actions(actions);
            return;
        }
        log_replica_event!(
            debug,
            self.id,
            self.view,
            "[bft] stored view-change",
            sender = sender,
            vc_view = vc_view
        );

        // f+1 replicas are past this view; one of them is correct.
        let max_view = self.vi.max_view();
        if max_view > self.view {
            self.view = max_view - 1;
            self.send_view_change();
            self.apply_view_actions(actions);
            return;
        }
        self.apply_view_actions(actions);

        if self.limbo && !self.is_primary() && self.vi.max_maj_view() == self.view {
            // A quorum is moving to this view; give the primary a full period.
            let now = self.now();
            self.vtimer.restart(now);
            self.limbo = false;
        }
    }

    pub(super) fn handle_new_view(&mut self, nv: NewView) {
        if !nv.is_well_formed(self.quorum.n, self.config.max_out) {
            self.drop_message("malformed_new_view", &WireMessage::NewView(nv));
            return;
        }
        let view = nv.view;
        let stored = self.with_view_info(|vi, ctx| vi.add_new_view(nv, ctx));
        if stored {
            log_replica_event!(debug, self.id, self.view, "[bft] stored new-view", nv_view = view);
        }
    }

    pub(super) fn handle_view_change_ack(&mut self, ack: ViewChangeAck) {
        self.with_view_info(|vi, ctx| vi.add_ack(ack, ctx));
    }

    /// Enter the current view once its new-view is complete.
    ///
    /// The checkpoint `min` with `digest` starts the view; sequence numbers
    /// in `(min, max)` are re-proposed with the values the new-view chose.
    pub(super) fn process_new_view(&mut self, min: Seqno, digest: Digest, max: Seqno, known_stable: Seqno) {
        assert!(known_stable <= min, "stable checkpoint above new-view base");

        self.vtimer.stop();
        self.vtimer.reset_period();
        self.vc_since_nv = false;
        self.limbo = false;

        if self.is_primary() {
            if let Some((nv, _)) = self.vi.my_new_view() {
                let nv = nv.clone();
                self.send(Destination::AllReplicas, WireMessage::NewView(nv));
            }
        }

        self.seqno = max - 1;
        let min = min.max(self.last_stable);
        self.low_bound = min;

        if known_stable > self.last_stable {
            // Makes room for the re-proposed sequence numbers below.
            self.mark_stable(known_stable, self.last_executed >= known_stable);
        }
        assert!(
            max - self.last_stable - 1 <= self.config.max_out,
            "new-view range does not fit the window"
        );

        let view = self.view;
        let primary = self.is_primary();
        let now = self.now();
        for n in (min + 1)..max {
            let Some((pp, chosen)) = self.vi.fetch_request(n) else {
                log_replica_event!(warn, self.id, view, "[bft] new-view has no value", seqno = n);
                continue;
            };
            if primary {
                self.plog.fetch(n).add_my_pre_prepare(pp, now);
            } else {
                debug_assert_eq!(pp.digest(), chosen);
                let prepare = Prepare::new(view, n, chosen, self.id);
                {
                    let pc = self.plog.fetch(n);
                    pc.add_my_prepare(prepare.clone(), now);
                    pc.add_old(pp, &mut self.brt);
                }
                self.send(Destination::AllReplicas, WireMessage::Prepare(prepare));
            }
        }

        if primary {
            self.send_pre_prepare();
        }

        if self.last_executed < min {
            self.has_nv_state = false;
            log_replica_event!(
                info,
                self.id,
                view,
                "[bft] missing new-view base checkpoint, fetching state",
                last_executed = self.last_executed,
                target = min
            );
            self.state
                .start_fetch(self.last_executed, Some(min), Some(digest), min <= known_stable);
            self.record_event(ReplicaEvent::StateFetchStarted { target: Some(min) });
        } else {
            self.has_nv_state = true;
            while let Some(request) = self.ro_queue.pop() {
                self.execute_read_only(&request);
            }
        }

        if !primary && !self.rqueue.is_empty() {
            self.vtimer.restart(now);
        }

        log_replica_event!(info, self.id, view, "[bft] installed new view", min = min, max = max);
        metrics::record_new_view(view);
        self.record_event(ReplicaEvent::NewViewInstalled { view, min, max });

        self.execute_committed();
    }
}
