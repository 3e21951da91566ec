//! Replica Service - the agreement engine
//!
//! # Architecture
//! - Single writer: one input (envelope, timer tick, completed fetch) is
//!   handled to completion before the next
//! - Three-phase ordering (pre-prepare, prepare, commit) inside a window of
//!   `max_out` sequence numbers above the last stable checkpoint
//! - The view-change coordinator ([`ViewInfo`]) never calls back into the
//!   replica; it returns [`ViewAction`]s that are applied here
//!
//! The handlers are split by concern:
//! - `normal`: requests, pre-prepares, prepares, commits
//! - `execution`: execution, checkpoints, stability, fetched state
//! - `view_change`: leaving a view and installing the next one
//! - `status`: negative acks, retransmission, key rotation
//! - `persistence`: shutdown and restart

mod api;
mod execution;
mod normal;
mod persistence;
mod runner;
mod status;
mod view_change;


pub use api::ReplicaService;
pub use persistence::PersistedReplica;
pub use runner::{ReplicaHandle, ReplicaRunner};

use crate::config::ReplicaConfig;
use crate::domain::{
    BigRequestTable, Certificate, Checkpoint, Commit, Destination, Envelope, NewKey,
    PreparedCert, QuorumParams, ReplyCache, RequestQueue, SequenceLog, StableCheckpointSet, Timer,
    ViewAction, ViewContext, ViewInfo, WireMessage,
};
use crate::error::{AgreementError, AgreementResult};
use crate::events::ReplicaEvent;
use crate::metrics;
use crate::ports::{
    Application, Clock, CryptoService, ReplicaStatus, StateSync, SystemClock, Transport,
};
use bft_telemetry::log_replica_event;
use shared_types::{Principal, ReplicaId, Seqno, View};
use std::sync::Arc;
use std::time::Instant;

/// Dependencies for Replica
pub struct ReplicaDependencies<T, C, S, A> {
    pub transport: Arc<T>,
    pub crypto: Arc<C>,
    pub state: Arc<S>,
    pub app: Arc<A>,
    pub config: ReplicaConfig,
}

/// Agreement engine of one replica.
pub struct Replica<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    transport: Arc<T>,
    crypto: Arc<C>,
    state: Arc<S>,
    app: Arc<A>,
    clock: Box<dyn Clock>,
    config: ReplicaConfig,
    quorum: QuorumParams,
    id: ReplicaId,

    view: View,
    /// Sent a view-change for `view` and not yet in it.
    limbo: bool,
    /// The state needed to act in the new view is present.
    has_nv_state: bool,
    /// Last sequence number assigned (primary) or re-proposed (new view).
    seqno: Seqno,
    last_stable: Seqno,
    /// Messages at or below this are ignored in the current view.
    low_bound: Seqno,
    last_prepared: Seqno,
    last_executed: Seqno,
    last_tentative_execute: Seqno,

    plog: SequenceLog<PreparedCert>,
    clog: SequenceLog<Certificate<Commit>>,
    elog: SequenceLog<Certificate<Checkpoint>>,
    /// Checkpoint certificate at `last_stable`.
    stable_cert: Certificate<Checkpoint>,
    sset: StableCheckpointSet,
    brt: BigRequestTable,
    rqueue: RequestQueue,
    ro_queue: RequestQueue,
    replies: ReplyCache,
    vi: ViewInfo,

    vtimer: Timer,
    stimer: Timer,
    ktimer: Option<Timer>,
    last_status: Option<Instant>,
    last_new_key: Option<NewKey>,
    /// A view-change was sent since the last installed new view.
    vc_since_nv: bool,
    events: Vec<ReplicaEvent>,
    stopped: bool,
}

impl<T, C, S, A> Replica<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    /// Create replica `id` in view 0 with an empty log.
    ///
    /// Takes the initial checkpoint at sequence number 0 if the state
    /// adapter does not hold one yet.
    pub fn new(id: ReplicaId, deps: ReplicaDependencies<T, C, S, A>) -> AgreementResult<Self> {
        deps.config.validate()?;
        if id >= deps.config.replica_count {
            return Err(AgreementError::UnknownPrincipal(Principal::Replica(id)));
        }

        let config = deps.config;
        let quorum = config.quorum();
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let now = clock.now();
        let max_out = config.max_out;

        let replies = ReplyCache::new();
        let digest = match deps.state.digest(0) {
            Some(digest) => digest,
            None => deps.state.checkpoint(0, replies.encode()?),
        };
        let mut stable_cert = Certificate::new(quorum.quorum(), quorum.weak(), id);
        stable_cert.add_mine(
            Checkpoint {
                seqno: 0,
                digest,
                stable: true,
                sender: id,
            },
            now,
        );
        stable_cert.make_complete();

        let mut stimer = Timer::new(config.status_period);
        stimer.start(now);
        let ktimer = config.key_rotation_period.map(|period| {
            let mut timer = Timer::new(period);
            timer.start(now);
            timer
        });

        log_replica_event!(
            info,
            id,
            0u64,
            "[bft] replica started",
            replicas = quorum.n,
            f = quorum.f
        );

        Ok(Self {
            transport: deps.transport,
            crypto: deps.crypto,
            state: deps.state,
            app: deps.app,
            clock,
            quorum,
            id,
            view: 0,
            limbo: false,
            has_nv_state: true,
            seqno: 0,
            last_stable: 0,
            low_bound: 0,
            last_prepared: 0,
            last_executed: 0,
            last_tentative_execute: 0,
            plog: SequenceLog::new(max_out, 0, || PreparedCert::new(quorum, id)),
            clog: SequenceLog::new(max_out, 0, || {
                Certificate::new(quorum.quorum(), quorum.weak(), id)
            }),
            elog: SequenceLog::new(max_out, 0, || {
                Certificate::new(quorum.quorum(), quorum.weak(), id)
            }),
            stable_cert,
            sset: StableCheckpointSet::new(quorum.n),
            brt: BigRequestTable::new(config.big_request_threshold),
            rqueue: RequestQueue::new(),
            ro_queue: RequestQueue::new(),
            replies,
            vi: ViewInfo::new(quorum, id, max_out),
            vtimer: Timer::with_backoff(
                config.view_change_timeout,
                ReplicaConfig::MAX_TIMEOUT_MULTIPLIER,
            ),
            stimer,
            ktimer,
            last_status: None,
            last_new_key: None,
            vc_since_nv: false,
            events: Vec::new(),
            stopped: false,
            config,
        })
    }

    /// Set custom clock (for testing)
    ///
    /// Periodic timers are re-armed against the new clock.
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        let now = self.clock.now();
        self.stimer.restart(now);
        if let Some(timer) = &mut self.ktimer {
            timer.restart(now);
        }
        if self.vtimer.is_running() {
            self.vtimer.restart(now);
        }
        self
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn last_stable(&self) -> Seqno {
        self.last_stable
    }

    pub fn last_executed(&self) -> Seqno {
        self.last_executed
    }

    /// Primary of the current view.
    pub fn primary(&self) -> ReplicaId {
        self.quorum.primary(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == self.id
    }

    /// True once the replica may act in the current view.
    pub fn has_new_view(&self) -> bool {
        self.view == 0 || (self.has_nv_state && self.vi.has_new_view(self.view))
    }

    /// True if `seqno` is inside the ordering window.
    pub fn in_window(&self, seqno: Seqno) -> bool {
        self.plog.within_range(seqno)
    }

    /// Point-in-time copy of the protocol markers.
    pub fn snapshot(&self) -> ReplicaStatus {
        ReplicaStatus {
            id: self.id,
            view: self.view,
            limbo: self.limbo,
            has_new_view: self.has_new_view(),
            seqno: self.seqno,
            last_stable: self.last_stable,
            last_prepared: self.last_prepared,
            last_executed: self.last_executed,
            last_tentative_execute: self.last_tentative_execute,
            queued_requests: self.rqueue.len(),
            fetching_state: self.state.in_fetch(),
        }
    }

    /// Take the events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<ReplicaEvent> {
        std::mem::take(&mut self.events)
    }

    fn ensure_running(&self) -> AgreementResult<()> {
        if self.stopped {
            return Err(AgreementError::ServiceStopped);
        }
        Ok(())
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn max_window(&self) -> Seqno {
        self.last_stable + self.config.max_out
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Handle one envelope.
    ///
    /// Unauthenticated or useless messages are dropped without error.
    pub fn deliver(&mut self, envelope: Envelope) -> AgreementResult<()> {
        self.ensure_running()?;

        let sender = envelope.sender;
        match sender {
            Principal::Replica(r) if r >= self.quorum.n => {
                return Err(AgreementError::UnknownPrincipal(sender));
            }
            Principal::Replica(r) if r == self.id => {
                self.drop_message("loopback", &envelope.message);
                return Ok(());
            }
            _ => {}
        }

        match (&envelope.message, envelope.message.claimed_sender()) {
            // Replicas relay requests to the primary and pre-prepares
            // during view changes; the inner checks cover those.
            (WireMessage::Request(_), _) => {}
            (WireMessage::PrePrepare(_), _) => {
                if sender.replica().is_none() {
                    self.drop_message("client_pre_prepare", &envelope.message);
                    return Ok(());
                }
            }
            (_, Some(claimed)) if claimed != sender => {
                return Err(AgreementError::SenderMismatch {
                    envelope: sender,
                    claimed,
                });
            }
            _ => {}
        }

        let bytes = envelope.signing_bytes()?;
        if !self.crypto.verify(sender, &bytes, &envelope.auth) {
            if let (WireMessage::Status(_), Principal::Replica(r)) = (&envelope.message, sender) {
                // The peer may have missed our latest key.
                if let Some(key) = self.last_new_key.clone() {
                    self.send(Destination::Replica(r), WireMessage::NewKey(key));
                }
            }
            self.drop_message("bad_authenticator", &envelope.message);
            return Ok(());
        }

        if self.state.in_check()
            && matches!(
                envelope.message,
                WireMessage::Request(_)
                    | WireMessage::PrePrepare(_)
                    | WireMessage::Prepare(_)
                    | WireMessage::Commit(_)
            )
        {
            self.drop_message("state_check", &envelope.message);
            return Ok(());
        }

        match (envelope.message, sender) {
            (WireMessage::Request(request), _) => self.handle_request(request),
            (WireMessage::PrePrepare(pp), Principal::Replica(from)) => {
                self.handle_pre_prepare(pp, from)
            }
            (WireMessage::Prepare(prepare), _) => self.handle_prepare(prepare),
            (WireMessage::Commit(commit), _) => self.handle_commit(commit),
            (WireMessage::Checkpoint(checkpoint), _) => self.handle_checkpoint(checkpoint),
            (WireMessage::ViewChange(vc), _) => self.handle_view_change(vc),
            (WireMessage::NewView(nv), _) => self.handle_new_view(nv),
            (WireMessage::ViewChangeAck(ack), _) => self.handle_view_change_ack(ack),
            (WireMessage::Status(status), _) => self.handle_status(status),
            (WireMessage::NewKey(key), _) => self.handle_new_key(key),
            (message, _) => self.drop_message("unexpected", &message),
        }
        Ok(())
    }

    /// Fire expired timers.
    pub fn tick(&mut self) -> AgreementResult<()> {
        self.ensure_running()?;
        let now = self.now();

        if self.vtimer.fire(now) {
            self.on_view_change_timeout();
        }
        if self.stimer.fire(now) {
            self.send_status();
            self.stimer.restart(now);
        }
        let rotate = self.ktimer.as_mut().map_or(false, |timer| timer.fire(now));
        if rotate {
            self.send_new_key();
            if let Some(timer) = &mut self.ktimer {
                timer.restart(now);
            }
        }
        Ok(())
    }

    /// Adopt fetched state if the background transfer completed.
    pub fn poll_state_sync(&mut self) -> AgreementResult<()> {
        self.ensure_running()?;
        if let Some(restored) = self.state.poll_fetch() {
            self.new_state(restored)?;
        }
        Ok(())
    }

    fn drop_message(&self, reason: &'static str, message: &WireMessage) {
        metrics::record_message_dropped(reason);
        log_replica_event!(
            debug,
            self.id,
            self.view,
            "[bft] dropped message",
            reason = reason,
            tag = message.tag().as_str()
        );
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Authenticate `message` for `to` and hand it to the transport.
    fn send(&self, to: Destination, message: WireMessage) {
        let mut envelope = Envelope::new(Principal::Replica(self.id), message);
        let bytes = match envelope.signing_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                log_replica_event!(warn, self.id, self.view, "[bft] cannot encode outbound message", error = %e);
                return;
            }
        };
        envelope.auth = if envelope.message.requires_signature() {
            self.crypto.sign(&bytes)
        } else {
            match to {
                Destination::AllReplicas => self.crypto.authenticate(&bytes),
                Destination::Replica(r) => {
                    self.crypto.authenticate_to(Principal::Replica(r), &bytes)
                }
                Destination::Client(c) => self.crypto.authenticate_to(Principal::Client(c), &bytes),
            }
        };
        self.transport.send(to, envelope);
    }

    // =========================================================================
    // VIEW-INFO GLUE
    // =========================================================================

    /// Run `f` against the view-change coordinator and apply what it asks for.
    fn with_view_info<R>(&mut self, f: impl FnOnce(&mut ViewInfo, &mut ViewContext<'_>) -> R) -> R {
        let mut actions = Vec::new();
        let now = self.now();
        let result = {
            let mut ctx = ViewContext {
                brt: &mut self.brt,
                actions: &mut actions,
                now,
            };
            f(&mut self.vi, &mut ctx)
        };
        self.apply_view_actions(actions);
        result
    }

    fn apply_view_actions(&mut self, actions: Vec<ViewAction>) {
        for action in actions {
            match action {
                ViewAction::Send { to, message } => self.send(to, message),
                ViewAction::SendStatus => self.send_status(),
                ViewAction::InstallNewView {
                    min,
                    digest,
                    max,
                    known_stable,
                } => {
                    if self.vi.view() == self.view && self.vi.has_new_view(self.view) {
                        self.process_new_view(min, digest, max, known_stable);
                    }
                }
                ViewAction::PrimaryFaulty { view } => {
                    log_replica_event!(
                        warn,
                        self.id,
                        self.view,
                        "[bft] new-view from faulty primary",
                        faulty_view = view
                    );
                    if view == self.view {
                        self.send_view_change();
                    }
                }
            }
        }
    }

    fn record_event(&mut self, event: ReplicaEvent) {
        log_replica_event!(debug, self.id, self.view, "[bft] event", kind = event.kind());
        self.events.push(event);
    }
}
