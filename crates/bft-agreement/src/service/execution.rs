//! Execution, checkpoints and log garbage collection.

use super::Replica;
use crate::domain::{
    Checkpoint, Destination, PrePrepare, Reply, ReplyCache, Request, WireMessage,
    LATE_CHECKPOINT_GRACE,
};
use crate::error::AgreementResult;
use crate::events::ReplicaEvent;
use crate::metrics;
use crate::ports::{Application, CryptoService, RestoredState, StateSync, Transport};
use bft_telemetry::{log_replica_event, log_seqno_event};
use shared_types::{ClientId, RequestId, Seqno};
use std::sync::Arc;

impl<T, C, S, A> Replica<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Execute the batch at `last_executed + 1` if it is prepared.
    ///
    /// With `committed` false the execution is tentative and replies are
    /// marked as such.
    pub(super) fn execute_prepared(&mut self, committed: bool) {
        let next = self.last_executed + 1;
        if self.last_tentative_execute >= next
            || self.last_executed >= self.max_window()
            || self.state.in_fetch()
            || self.state.in_check()
            || !self.has_new_view()
        {
            return;
        }
        let Some(pp) = self.prepared_pre_prepare(next) else {
            return;
        };

        self.last_tentative_execute = next;
        for request in self.batch_requests(&pp) {
            let client = request.client_id;
            if self.replies.req_id(client) >= request.request_id {
                // Already executed: resend the cached reply.
                if let Some(reply) = self.replies.reply(client, self.view, self.id) {
                    self.send(Destination::Client(client), WireMessage::Reply(reply));
                }
                continue;
            }
            let result = self
                .app
                .exec(&request.command, pp.choices(), client, false, !committed);
            self.replies
                .record(client, request.request_id, result.clone(), committed);
            let reply = Reply {
                view: self.view,
                request_id: request.request_id,
                client_id: client,
                sender: self.id,
                tentative: !committed,
                result,
            };
            self.send(Destination::Client(client), WireMessage::Reply(reply));
        }
    }

    /// The pre-prepare at `seqno` if it is prepared in the current view.
    fn prepared_pre_prepare(&self, seqno: Seqno) -> Option<Arc<PrePrepare>> {
        let pc = self.plog.get(seqno)?;
        if !pc.is_complete() {
            return None;
        }
        pc.pre_prepare()
            .filter(|pp| pp.view == self.view)
            .cloned()
    }

    /// Inlined requests followed by out-of-band bodies, in batch order.
    fn batch_requests(&self, pp: &PrePrepare) -> Vec<Request> {
        let mut requests = pp.requests().to_vec();
        for digest in pp.big_requests() {
            let body = self.brt.lookup(digest);
            assert!(
                body.is_some(),
                "prepared pre-prepare {} lacks out-of-band request {}",
                pp.seqno,
                digest
            );
            requests.extend(body.cloned());
        }
        requests
    }

    /// Execute, in order, every committed batch after `last_executed`.
    pub(super) fn execute_committed(&mut self) {
        if self.state.in_fetch() || self.state.in_check() || !self.has_new_view() {
            return;
        }

        loop {
            let next = self.last_executed + 1;
            if self.last_executed >= self.max_window() || self.last_executed < self.last_stable {
                break;
            }
            let committed = self.clog.get(next).map_or(false, |cc| cc.is_complete());
            if !committed {
                break;
            }
            let Some(pp) = self.prepared_pre_prepare(next) else {
                break;
            };

            self.execute_prepared(true);
            self.last_executed = next;
            log_seqno_event!(debug, self.id, self.view, next, "[bft] executed", digest = %pp.digest());
            metrics::record_seqno_executed(next);

            while let Some(request) = self.ro_queue.pop() {
                if !self.execute_read_only(&request) {
                    self.ro_queue.append(request);
                    break;
                }
            }

            let mut executed: Vec<(ClientId, RequestId)> = Vec::new();
            for request in self.batch_requests(&pp) {
                let client = request.client_id;
                self.replies.commit(client);
                if self.rqueue.remove(client, request.request_id) {
                    self.vtimer.stop();
                }
                executed.push((client, request.request_id));
            }

            if next % self.config.checkpoint_interval == 0 {
                self.take_checkpoint(next);
            }

            self.record_event(ReplicaEvent::Executed {
                seqno: next,
                digest: pp.digest(),
                requests: executed,
            });
        }

        if !self.rqueue.is_empty() {
            if self.is_primary() {
                self.send_pre_prepare();
            } else {
                let now = self.now();
                self.vtimer.start(now);
            }
        }
    }

    /// Execute a read-only request against the current state.
    ///
    /// Only possible when no tentative execution is outstanding and the
    /// state is consistent. Returns false if the request must wait.
    pub(super) fn execute_read_only(&mut self, request: &Request) -> bool {
        if self.last_tentative_execute != self.last_executed
            || self.state.in_fetch()
            || self.state.in_check()
        {
            return false;
        }
        let client = request.client_id;
        let result = self.app.exec(&request.command, &[], client, true, true);
        let reply = Reply {
            view: self.view,
            request_id: request.request_id,
            client_id: client,
            sender: self.id,
            tentative: true,
            result,
        };
        self.send(Destination::Client(client), WireMessage::Reply(reply));
        true
    }

    // =========================================================================
    // CHECKPOINTS
    // =========================================================================

    fn take_checkpoint(&mut self, seqno: Seqno) {
        let protocol_state = match self.replies.encode() {
            Ok(bytes) => bytes,
            Err(e) => panic!("reply cache at {seqno} cannot be encoded: {e}"),
        };
        let digest = self.state.checkpoint(seqno, protocol_state);
        let checkpoint = Checkpoint {
            seqno,
            digest,
            stable: false,
            sender: self.id,
        };
        log_seqno_event!(debug, self.id, self.view, seqno, "[bft] checkpoint taken", digest = %digest);

        let now = self.now();
        let complete = {
            let cert = self.elog.fetch(seqno);
            cert.add_mine(checkpoint.clone(), now);
            cert.is_complete()
        };
        self.send(Destination::AllReplicas, WireMessage::Checkpoint(checkpoint));
        if complete {
            self.mark_stable(seqno, true);
        }
    }

    /// This replica's checkpoint at `last_stable`, flagged stable for relay.
    pub(super) fn my_stable_checkpoint(&self) -> Option<Checkpoint> {
        self.stable_cert.mine().map(|c| Checkpoint {
            stable: true,
            ..c.clone()
        })
    }

    pub(super) fn handle_checkpoint(&mut self, checkpoint: Checkpoint) {
        let seqno = checkpoint.seqno;
        if seqno <= self.last_stable {
            self.drop_message("checkpoint_below_window", &WireMessage::Checkpoint(checkpoint));
            return;
        }

        if seqno <= self.max_window() {
            // A stable checkpoint above last_executed may mean the messages
            // this replica is missing were already collected elsewhere.
            let mut late = checkpoint.stable && self.last_executed < seqno;
            if let Some(sent) = self
                .clog
                .get(self.last_executed)
                .and_then(|cc| cc.mine_sent_at())
            {
                late &= self.now().saturating_duration_since(sent) > LATE_CHECKPOINT_GRACE;
            }

            if !late {
                let stable = {
                    let cert = self.elog.fetch(seqno);
                    cert.add(checkpoint) && cert.mine().is_some() && cert.is_complete()
                };
                if stable {
                    self.mark_stable(seqno, true);
                }
                return;
            }
        }

        if !checkpoint.stable {
            // Above the window: ask for what is missing.
            self.send_status();
            return;
        }

        if self.sset.store(checkpoint) && self.sset.len() > self.quorum.f {
            self.fetch_stable_state();
        }
    }

    /// More than f peers are past this replica's window: fetch their state.
    fn fetch_stable_state(&mut self) {
        if self.state.in_fetch() {
            return;
        }
        if self.last_tentative_execute > self.last_executed {
            self.rollback();
        }
        self.vtimer.stop();
        log_replica_event!(
            info,
            self.id,
            self.view,
            "[bft] fell behind stable checkpoints, fetching state",
            last_executed = self.last_executed
        );
        self.state.start_fetch(self.last_executed, None, None, false);
        self.record_event(ReplicaEvent::StateFetchStarted { target: None });
    }

    /// Undo tentative execution back to the last checkpoint.
    pub(super) fn rollback(&mut self) {
        assert!(
            !self.state.in_fetch(),
            "rollback requested while fetching state"
        );
        let restored = self.state.rollback();
        self.last_executed = restored.seqno;
        self.last_tentative_execute = restored.seqno;
        self.replies = ReplyCache::decode(&restored.protocol_state).unwrap_or_else(|e| {
            panic!("checkpoint {} has an unreadable reply cache: {e}", restored.seqno)
        });
        log_replica_event!(info, self.id, self.view, "[bft] rolled back", seqno = restored.seqno);
    }

    /// Advance the window to `seqno`, whose checkpoint gathered a quorum.
    ///
    /// `have_state` says whether this replica holds the state at `seqno`.
    pub(super) fn mark_stable(&mut self, seqno: Seqno, have_state: bool) {
        if seqno <= self.last_stable {
            return;
        }
        self.last_stable = seqno;
        self.low_bound = self.low_bound.max(seqno);

        if have_state && self.last_stable > self.last_executed {
            self.last_executed = self.last_stable;
            self.last_tentative_execute = self.last_stable;
            let replies = &self.replies;
            if self.rqueue.retain_newer(|client| replies.req_id(client)) {
                self.vtimer.stop();
            }
            self.last_prepared = self.last_prepared.max(self.last_stable);
        }
        self.seqno = self.seqno.max(self.last_stable);

        // The certificate at the new base moves out of the window.
        let base = self.elog.get(seqno).cloned();
        self.plog.truncate(seqno);
        self.clog.truncate(seqno);
        self.elog.truncate(seqno);
        if let Some(mut cert) = base {
            cert.make_complete();
            self.stable_cert = cert;
        } else {
            self.stable_cert.clear();
        }

        let mut actions = Vec::new();
        self.vi.mark_stable(seqno, &mut actions);
        self.state.discard_checkpoint(seqno, self.last_executed);
        self.brt.mark_stable(seqno);

        if have_state && self.stable_cert.mine().is_none() {
            if let Some(digest) = self.state.digest(seqno) {
                let now = self.now();
                self.stable_cert.add_mine(
                    Checkpoint {
                        seqno,
                        digest,
                        stable: false,
                        sender: self.id,
                    },
                    now,
                );
                self.stable_cert.make_complete();
            }
        }

        log_seqno_event!(info, self.id, self.view, seqno, "[bft] checkpoint stable");
        metrics::record_stable_checkpoint(seqno);
        self.record_event(ReplicaEvent::CheckpointStable { seqno });

        // Stable checkpoints reported from above the old window may now fit.
        let mut next_stable = None;
        for checkpoint in self.sset.take_within(seqno, self.config.max_out) {
            let at = checkpoint.seqno;
            let cert = self.elog.fetch(at);
            cert.add(checkpoint);
            if cert.mine().is_some() && cert.is_complete() {
                next_stable = next_stable.max(Some(at));
            }
        }

        self.apply_view_actions(actions);

        if let Some(at) = next_stable {
            self.mark_stable(at, true);
        } else if self.is_primary() {
            self.send_pre_prepare();
        }
    }

    // =========================================================================
    // FETCHED STATE
    // =========================================================================

    /// Adopt state fetched (or checked) up to `restored.seqno`.
    pub fn new_state(&mut self, restored: RestoredState) -> AgreementResult<()> {
        self.ensure_running()?;
        let seqno = restored.seqno;

        if self.vi.has_new_view(self.view) && seqno >= self.low_bound {
            self.has_nv_state = true;
        }

        if seqno > self.last_executed {
            self.last_executed = seqno;
            self.last_tentative_execute = seqno;
            self.replies = ReplyCache::decode(&restored.protocol_state)?;
            let replies = &self.replies;
            if self.rqueue.retain_newer(|client| replies.req_id(client)) {
                self.vtimer.stop();
            }
            self.last_prepared = self.last_prepared.max(seqno);

            if seqno > self.max_window() {
                let base = seqno - self.config.max_out;
                let have = self
                    .elog
                    .get(base)
                    .map_or(false, |cert| cert.mine().is_some());
                self.mark_stable(base, have);
            }

            if seqno % self.config.checkpoint_interval == 0 && self.elog.within_range(seqno) {
                if let Some(digest) = self.state.digest(seqno) {
                    let checkpoint = Checkpoint {
                        seqno,
                        digest,
                        stable: false,
                        sender: self.id,
                    };
                    let now = self.now();
                    let fresh = self.elog.fetch(seqno).add_mine(checkpoint.clone(), now);
                    if fresh {
                        self.send(Destination::AllReplicas, WireMessage::Checkpoint(checkpoint));
                    }
                }
            }
        }

        if self.sset.count_at_least(seqno) > self.quorum.f {
            self.mark_stable(seqno, true);
        } else if self
            .elog
            .get(seqno)
            .map_or(false, |cert| cert.mine().is_some() && cert.is_complete())
        {
            self.mark_stable(seqno, true);
        }

        self.seqno = self.seqno.max(seqno);
        log_seqno_event!(info, self.id, self.view, seqno, "[bft] adopted fetched state");
        self.record_event(ReplicaEvent::StateFetched { seqno });

        self.execute_committed();
        while let Some(request) = self.ro_queue.pop() {
            if !self.execute_read_only(&request) {
                self.ro_queue.append(request);
                break;
            }
        }

        if !self.rqueue.is_empty() {
            if self.is_primary() {
                self.send_pre_prepare();
            } else {
                let now = self.now();
                self.vtimer.restart(now);
            }
        }
        Ok(())
    }
}
