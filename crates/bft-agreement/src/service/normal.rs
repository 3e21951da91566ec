//! Normal-case ordering: requests, pre-prepares, prepares and commits.

use super::Replica;
use crate::domain::{
    Batch, Commit, Destination, PrePrepare, Prepare, Request, WireMessage, MAX_BIG_REQUESTS,
};
use crate::metrics;
use crate::ports::{Application, CryptoService, StateSync, Transport};
use bft_telemetry::log_seqno_event;
use shared_types::{ReplicaId, Seqno, View};
use std::sync::Arc;

impl<T, C, S, A> Replica<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    // =========================================================================
    // WINDOW CHECKS
    // =========================================================================

    /// True if `seqno` is in the window and `view` is the current view.
    pub(super) fn in_wv(&mut self, view: View, seqno: Seqno) -> bool {
        let in_window = seqno > self.last_stable && seqno <= self.max_window();
        if in_window && view == self.view {
            return true;
        }
        if view > self.view || seqno > self.max_window() {
            self.send_status();
        }
        false
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    pub(super) fn handle_request(&mut self, request: Request) {
        let verified = self.crypto.verify_request(&request);
        if !(self.has_new_view() && verified) {
            // Bodies of out-of-band requests are kept if a pre-prepare
            // already references them.
            if self.brt.is_big(&request) && self.add_big_request(request, false) {
                return;
            }
            metrics::record_message_dropped("request_not_accepted");
            return;
        }

        let client = request.client_id;
        let request_id = request.request_id;

        if request.read_only {
            if !self.execute_read_only(&request) {
                self.ro_queue.append(request);
            }
            return;
        }

        let last = self.replies.req_id(client);
        if last < request_id {
            if self.is_primary() {
                if !self.rqueue.in_progress(client, request_id, self.view)
                    && self.rqueue.append(request)
                {
                    self.send_pre_prepare();
                }
            } else {
                if self.brt.is_big(&request) && self.add_big_request(request.clone(), true) {
                    return;
                }
                if self.rqueue.append(request.clone()) && !self.limbo {
                    let primary = self.primary();
                    self.send(Destination::Replica(primary), WireMessage::Request(request));
                    let now = self.now();
                    self.vtimer.start(now);
                }
            }
        } else if last == request_id {
            if let Some(reply) = self.replies.reply(client, self.view, self.id) {
                self.send(Destination::Client(client), WireMessage::Reply(reply));
            }
            if !self.is_primary()
                && !self.replies.is_committed(client)
                && self.rqueue.append(request)
            {
                let now = self.now();
                self.vtimer.start(now);
            }
        }
    }

    /// Offer an out-of-band request body. Returns true if it was kept.
    pub(super) fn add_big_request(&mut self, request: Request, verified: bool) -> bool {
        let digest = request.digest();
        let Some(waiting) = self.brt.add_request(request, verified) else {
            return false;
        };
        for (seqno, index) in waiting {
            if self.plog.within_range(seqno) {
                self.plog.fetch(seqno).add_missing(&digest, index);
                self.send_prepare(seqno);
            }
            self.with_view_info(|vi, ctx| vi.add_missing_big(&digest, seqno, index, ctx));
        }
        true
    }

    // =========================================================================
    // PRE-PREPARE
    // =========================================================================

    /// Order queued requests if the window and congestion limit allow.
    pub(super) fn send_pre_prepare(&mut self) {
        assert!(self.is_primary(), "non-primary replica tried to order requests");

        if self.rqueue.is_empty()
            || self.seqno + 1 > self.last_executed + self.config.congestion_window
            || self.seqno + 1 > self.max_window()
            || !self.has_new_view()
        {
            return;
        }

        self.seqno += 1;
        let seqno = self.seqno;
        let view = self.view;

        let max_size = self.config.max_message_size;
        let brt = &self.brt;
        let mut big_count = 0usize;
        let popped = self.rqueue.pop_batch(view, max_size, |request| {
            if brt.is_big(request) {
                big_count += 1;
                big_count <= MAX_BIG_REQUESTS
            } else {
                true
            }
        });

        let mut inline = Vec::new();
        let mut big = Vec::new();
        for request in popped {
            if self.brt.is_big(&request) {
                let digest = request.digest();
                let index = big.len();
                self.brt.add_request(request, true);
                self.brt.add_pre_prepare(digest, index, seqno, view);
                big.push(digest);
            } else {
                inline.push(request);
            }
        }
        let ordered = inline.len() + big.len();

        let choices = self.app.non_det_choices(seqno);
        let pp = Arc::new(PrePrepare::new(view, seqno, Batch::new(inline, big, choices)));
        metrics::record_requests_ordered(ordered);
        log_seqno_event!(
            debug,
            self.id,
            view,
            seqno,
            "[bft] sending pre-prepare",
            requests = ordered,
            digest = %pp.digest()
        );

        self.send(Destination::AllReplicas, WireMessage::PrePrepare((*pp).clone()));
        let now = self.now();
        self.plog.fetch(seqno).add_my_pre_prepare(pp, now);
    }

    pub(super) fn handle_pre_prepare(&mut self, pp: PrePrepare, from: ReplicaId) {
        let seqno = pp.seqno;
        if self.in_wv(pp.view, seqno) && seqno > self.low_bound && self.has_new_view() {
            if !self.pre_prepare_acceptable(&pp, from) {
                self.drop_message("invalid_pre_prepare", &WireMessage::PrePrepare(pp));
                return;
            }
            let pp = Arc::new(pp);
            let accepted = {
                let pc = self.plog.fetch(seqno);
                pc.add_pre_prepare(pp, &mut self.brt)
            };
            if accepted {
                log_seqno_event!(debug, self.id, self.view, seqno, "[bft] accepted pre-prepare", sender = from);
                self.send_prepare(seqno);
            }
            return;
        }

        if !self.has_new_view() {
            // May be an old pre-prepare needed to complete the view change.
            self.with_view_info(|vi, ctx| vi.add_missing_pp(&pp, ctx));
            return;
        }
        self.drop_message("pre_prepare_out_of_window", &WireMessage::PrePrepare(pp));
    }

    fn pre_prepare_acceptable(&self, pp: &PrePrepare, from: ReplicaId) -> bool {
        from == self.quorum.primary(pp.view)
            && pp.batch.check_digest()
            && self.app.check_non_det(pp.choices())
            && pp
                .requests()
                .iter()
                .all(|request| self.crypto.verify_request(request))
    }

    // =========================================================================
    // PREPARE
    // =========================================================================

    /// Send this backup's prepare for `seqno` once its pre-prepare is whole.
    pub(super) fn send_prepare(&mut self, seqno: Seqno) {
        if !self.plog.within_range(seqno) {
            return;
        }
        let now = self.now();
        let view = self.view;
        let id = self.id;
        let pc = self.plog.fetch(seqno);
        if pc.is_primary() || pc.my_prepare().is_some() || !pc.is_pp_complete() {
            return;
        }
        let Some(pp) = pc.pre_prepare() else {
            return;
        };
        if pp.view != view {
            return;
        }
        let prepare = Prepare::new(view, seqno, pp.digest(), id);
        pc.add_my_prepare(prepare.clone(), now);
        let complete = pc.is_complete();
        self.send(Destination::AllReplicas, WireMessage::Prepare(prepare));
        if complete {
            self.send_commit(seqno);
        }
    }

    pub(super) fn handle_prepare(&mut self, prepare: Prepare) {
        let seqno = prepare.seqno;
        if self.in_wv(prepare.view, seqno)
            && seqno > self.low_bound
            && prepare.sender != self.primary()
            && self.has_new_view()
        {
            let complete = {
                let pc = self.plog.fetch(seqno);
                pc.add_prepare(prepare) && pc.is_complete()
            };
            if complete {
                self.send_commit(seqno);
            }
            return;
        }

        if prepare.proof && !self.has_new_view() {
            self.with_view_info(|vi, ctx| vi.add_missing_prepare(&prepare, ctx));
            return;
        }
        self.drop_message("prepare_not_accepted", &WireMessage::Prepare(prepare));
    }

    // =========================================================================
    // COMMIT
    // =========================================================================

    /// Broadcast this replica's commit for the prepared `seqno`.
    pub(super) fn send_commit(&mut self, seqno: Seqno) {
        if seqno == self.last_executed + 1 && self.config.tentative_execution() {
            self.execute_prepared(false);
        }
        if seqno > self.last_prepared {
            self.last_prepared = seqno;
        }

        let now = self.now();
        let commit = Commit {
            view: self.view,
            seqno,
            sender: self.id,
        };
        let cc = self.clog.fetch(seqno);
        if cc.mine().is_some() {
            return;
        }
        cc.add_mine(commit.clone(), now);
        let complete = cc.is_complete();
        log_seqno_event!(debug, self.id, self.view, seqno, "[bft] prepared, sending commit");
        self.send(Destination::AllReplicas, WireMessage::Commit(commit));
        if complete {
            self.execute_committed();
        }
    }

    pub(super) fn handle_commit(&mut self, commit: Commit) {
        let seqno = commit.seqno;
        if self.in_wv(commit.view, seqno) && seqno > self.low_bound {
            let complete = {
                let cc = self.clog.fetch(seqno);
                cc.add(commit) && cc.is_complete()
            };
            if complete {
                self.execute_committed();
            }
            return;
        }
        self.drop_message("commit_not_accepted", &WireMessage::Commit(commit));
    }
}
