//! Deterministic in-process network of replicas.
//!
//! Envelopes are delivered one at a time in FIFO order. Time only moves
//! when a test calls [`SimNetwork::advance`], which also fires every live
//! replica's timers.

use bft_agreement::adapters::{
    InMemoryStateSync, KeyRingCrypto, KvApplication, KvStore, ManualClock, SharedCheckpointStore,
};
use bft_agreement::{
    CryptoService, Destination, Envelope, QuorumParams, Replica, ReplicaConfig,
    ReplicaDependencies, ReplicaEvent, Transport, WireMessage,
};
use parking_lot::Mutex;
use shared_types::{ClientId, Principal, ReplicaId, RequestId, Seqno};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Secret every simulated principal derives its keys from.
pub const MASTER: [u8; 32] = [0x42; 32];

/// Upper bound on deliveries in one [`SimNetwork::run_until_quiet`].
const MAX_DELIVERIES: usize = 2_000_000;

pub type SimReplica = Replica<SimTransport, KeyRingCrypto, InMemoryStateSync, KvApplication>;

/// Decides whether to drop one delivery: `(from, to, message)`.
pub type DropFilter = Box<dyn Fn(Principal, Principal, &WireMessage) -> bool + Send>;

/// Shared FIFO every replica sends into.
#[derive(Clone, Default)]
pub struct SimTransport {
    queue: Arc<Mutex<VecDeque<(Destination, Envelope)>>>,
}

impl SimTransport {
    fn pop(&self) -> Option<(Destination, Envelope)> {
        self.queue.lock().pop_front()
    }
}

impl Transport for SimTransport {
    fn send(&self, to: Destination, envelope: Envelope) {
        self.queue.lock().push_back((to, envelope));
    }
}

/// One replica and the adapters behind it.
pub struct SimNode {
    pub replica: SimReplica,
    pub store: KvStore,
    pub state: Arc<InMemoryStateSync>,
    app: Arc<KvApplication>,
    crypto: Arc<KeyRingCrypto>,
    /// Every event the replica recorded, in order.
    pub events: Vec<ReplicaEvent>,
    crashed: bool,
}

impl SimNode {
    /// `(seqno, requests)` of every executed batch.
    pub fn executed(&self) -> Vec<(Seqno, Vec<(ClientId, RequestId)>)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ReplicaEvent::Executed {
                    seqno, requests, ..
                } => Some((*seqno, requests.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    fn drain(&mut self) {
        let events = self.replica.drain_events();
        self.events.extend(events);
    }
}

/// A deployment of `replica_count` replicas over a [`SimTransport`].
pub struct SimNetwork {
    config: ReplicaConfig,
    clock: ManualClock,
    transport: SimTransport,
    nodes: Vec<SimNode>,
    filters: Vec<DropFilter>,
    client_inbox: HashMap<ClientId, Vec<Envelope>>,
    delivered: usize,
}

impl SimNetwork {
    pub fn new(config: ReplicaConfig) -> Self {
        let clock = ManualClock::new();
        let transport = SimTransport::default();
        let registry = SharedCheckpointStore::new();
        let weak = config.quorum().weak();

        let nodes = (0..config.replica_count)
            .map(|id| {
                let store = KvStore::new();
                let state = Arc::new(InMemoryStateSync::new(
                    id,
                    store.clone(),
                    Arc::clone(&registry),
                    weak,
                ));
                let app = Arc::new(KvApplication::new(store.clone()));
                let crypto = Arc::new(KeyRingCrypto::new(
                    Principal::Replica(id),
                    config.replica_count,
                    MASTER,
                ));
                let deps = ReplicaDependencies {
                    transport: Arc::new(transport.clone()),
                    crypto: Arc::clone(&crypto),
                    state: Arc::clone(&state),
                    app: Arc::clone(&app),
                    config: config.clone(),
                };
                let replica = match Replica::new(id, deps) {
                    Ok(replica) => replica.with_clock(Box::new(clock.clone())),
                    Err(e) => panic!("replica {id} rejected the configuration: {e}"),
                };
                SimNode {
                    replica,
                    store,
                    state,
                    app,
                    crypto,
                    events: Vec::new(),
                    crashed: false,
                }
            })
            .collect();

        Self {
            config,
            clock,
            transport,
            nodes,
            filters: Vec::new(),
            client_inbox: HashMap::new(),
            delivered: 0,
        }
    }

    /// Four replicas tolerating one fault, with deterministic timers.
    pub fn four() -> Self {
        Self::new(test_config())
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn quorum(&self) -> QuorumParams {
        self.config.quorum()
    }

    pub fn node(&self, id: ReplicaId) -> &SimNode {
        &self.nodes[id]
    }

    pub fn replica(&self, id: ReplicaId) -> &SimReplica {
        &self.nodes[id].replica
    }

    /// Ids of replicas that are not crashed.
    pub fn live(&self) -> Vec<ReplicaId> {
        (0..self.nodes.len())
            .filter(|id| !self.nodes[*id].crashed)
            .collect()
    }

    /// Envelopes delivered so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Stop delivering to and ticking `id`. Its state is kept.
    pub fn crash(&mut self, id: ReplicaId) {
        self.nodes[id].crashed = true;
    }

    pub fn recover(&mut self, id: ReplicaId) {
        self.nodes[id].crashed = false;
    }

    pub fn add_filter(&mut self, filter: DropFilter) {
        self.filters.push(filter);
    }

    pub fn clear_filters(&mut self) {
        self.filters.clear();
    }

    /// Cut `id` off from every other principal.
    pub fn partition(&mut self, id: ReplicaId) {
        let me = Principal::Replica(id);
        self.add_filter(Box::new(move |from, to, _| from == me || to == me));
    }

    /// Queue `envelope` for `to` as if a peer had sent it.
    pub fn inject(&mut self, to: Destination, envelope: Envelope) {
        self.transport.send(to, envelope);
    }

    /// Envelope from replica `sender` authenticated with its own keys, as
    /// a faulty replica would produce it.
    pub fn forge(&self, sender: ReplicaId, message: WireMessage) -> Envelope {
        let crypto = &self.nodes[sender].crypto;
        let mut envelope = Envelope::new(Principal::Replica(sender), message);
        let bytes = match envelope.signing_bytes() {
            Ok(bytes) => bytes,
            Err(e) => panic!("forged message cannot be encoded: {e}"),
        };
        envelope.auth = if envelope.message.requires_signature() {
            crypto.sign(&bytes)
        } else {
            crypto.authenticate(&bytes)
        };
        envelope
    }

    /// Envelopes addressed to `client` since the last call.
    pub fn take_client_messages(&mut self, client: ClientId) -> Vec<Envelope> {
        self.client_inbox.remove(&client).unwrap_or_default()
    }

    /// Deliver queued envelopes until none are left.
    pub fn run_until_quiet(&mut self) {
        let mut steps = 0usize;
        while let Some((to, envelope)) = self.transport.pop() {
            steps += 1;
            assert!(
                steps < MAX_DELIVERIES,
                "network did not quiesce after {MAX_DELIVERIES} deliveries"
            );
            for target in self.targets(to, envelope.sender) {
                self.deliver_to(target, &envelope);
            }
        }
    }

    /// Move the clock, fire timers everywhere, then deliver what that sent.
    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        for node in self.nodes.iter_mut().filter(|node| !node.crashed) {
            let id = node.replica.id();
            if let Err(e) = node.replica.tick() {
                tracing::debug!(replica = id, error = %e, "[sim] tick failed");
            }
            if let Err(e) = node.replica.poll_state_sync() {
                tracing::debug!(replica = id, error = %e, "[sim] state sync failed");
            }
            node.drain();
        }
        self.run_until_quiet();
    }

    /// `steps` rounds of [`advance`](Self::advance) by `by`.
    pub fn settle(&mut self, steps: usize, by: Duration) {
        for _ in 0..steps {
            self.advance(by);
        }
    }

    /// Stop replica `id` and take its persisted state.
    pub fn shutdown(&mut self, id: ReplicaId) -> Vec<u8> {
        let node = &mut self.nodes[id];
        let bytes = match node.replica.shutdown() {
            Ok(bytes) => bytes,
            Err(e) => panic!("replica {id} failed to shut down: {e}"),
        };
        node.drain();
        node.crashed = true;
        bytes
    }

    /// Rebuild replica `id` from `bytes`, keeping its application state.
    pub fn restart(&mut self, id: ReplicaId, bytes: &[u8]) {
        let node = &mut self.nodes[id];
        let deps = ReplicaDependencies {
            transport: Arc::new(self.transport.clone()),
            crypto: Arc::clone(&node.crypto),
            state: Arc::clone(&node.state),
            app: Arc::clone(&node.app),
            config: self.config.clone(),
        };
        node.replica = match Replica::restart(id, deps, bytes) {
            Ok(replica) => replica.with_clock(Box::new(self.clock.clone())),
            Err(e) => panic!("replica {id} failed to restart: {e}"),
        };
        node.crashed = false;
    }

    fn targets(&self, to: Destination, sender: Principal) -> Vec<Principal> {
        match to {
            Destination::Replica(r) => vec![Principal::Replica(r)],
            Destination::Client(c) => vec![Principal::Client(c)],
            Destination::AllReplicas => (0..self.nodes.len())
                .map(Principal::Replica)
                .filter(|target| *target != sender)
                .collect(),
        }
    }

    fn deliver_to(&mut self, target: Principal, envelope: &Envelope) {
        if self
            .filters
            .iter()
            .any(|drop| drop(envelope.sender, target, &envelope.message))
        {
            return;
        }
        match target {
            Principal::Client(c) => {
                self.client_inbox
                    .entry(c)
                    .or_default()
                    .push(envelope.clone());
            }
            Principal::Replica(r) => {
                let Some(node) = self.nodes.get_mut(r) else {
                    return;
                };
                if node.crashed {
                    return;
                }
                self.delivered += 1;
                if let Err(e) = node.replica.deliver(envelope.clone()) {
                    tracing::debug!(replica = r, error = %e, "[sim] delivery rejected");
                }
                node.drain();
            }
        }
    }
}

/// Configuration used by the simulations: one-second view-change timeout,
/// no key rotation, default window and checkpoint interval.
pub fn test_config() -> ReplicaConfig {
    ReplicaConfig {
        view_change_timeout: Duration::from_secs(1),
        key_rotation_period: None,
        ..ReplicaConfig::default()
    }
}
