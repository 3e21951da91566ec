//! Transport adapters
//!
//! [`RecordingTransport`] keeps every outbound envelope for inspection.
//! [`ChannelTransport`] encodes envelopes and pushes them into the tokio
//! channels feeding each peer's [`ReplicaRunner`](crate::service::ReplicaRunner).

use crate::domain::{Destination, Envelope};
use crate::ports::Transport;
use parking_lot::RwLock;
use shared_types::{ClientId, ReplicaId};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

/// Records outbound envelopes in send order.
#[derive(Default)]
pub struct RecordingTransport {
    sent: RwLock<Vec<(Destination, Envelope)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything sent so far.
    pub fn sent(&self) -> Vec<(Destination, Envelope)> {
        self.sent.read().clone()
    }

    /// Take everything sent so far.
    pub fn take(&self) -> Vec<(Destination, Envelope)> {
        std::mem::take(&mut *self.sent.write())
    }

    pub fn len(&self) -> usize {
        self.sent.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.read().is_empty()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, to: Destination, envelope: Envelope) {
        self.sent.write().push((to, envelope));
    }
}

/// Encodes envelopes onto per-principal byte channels.
///
/// One instance may be shared by every replica of a deployment; broadcasts
/// skip the sending replica. A full, closed or unknown channel drops the
/// message and status retransmission recovers it.
#[derive(Default)]
pub struct ChannelTransport {
    replicas: RwLock<BTreeMap<ReplicaId, mpsc::Sender<Vec<u8>>>>,
    clients: RwLock<HashMap<ClientId, mpsc::Sender<Vec<u8>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route envelopes for `replica` into `sender`.
    pub fn connect_replica(&self, replica: ReplicaId, sender: mpsc::Sender<Vec<u8>>) {
        self.replicas.write().insert(replica, sender);
    }

    pub fn register_client(&self, client: ClientId, sender: mpsc::Sender<Vec<u8>>) {
        self.clients.write().insert(client, sender);
    }

    /// Drop every route. Runners exit once their own handles are gone too.
    pub fn disconnect_all(&self) {
        self.replicas.write().clear();
        self.clients.write().clear();
    }

    fn push(channel: &mpsc::Sender<Vec<u8>>, bytes: Vec<u8>) {
        if let Err(e) = channel.try_send(bytes) {
            tracing::debug!(error = %e, "[bft] outbound message dropped");
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: Destination, envelope: Envelope) {
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "[bft] cannot encode envelope");
                return;
            }
        };
        match to {
            Destination::Replica(r) => match self.replicas.read().get(&r) {
                Some(channel) => Self::push(channel, bytes),
                None => tracing::debug!(replica = r, "[bft] no channel for replica"),
            },
            Destination::AllReplicas => {
                let me = envelope.sender.replica();
                for (r, channel) in self.replicas.read().iter() {
                    if Some(*r) != me {
                        Self::push(channel, bytes.clone());
                    }
                }
            }
            Destination::Client(c) => match self.clients.read().get(&c) {
                Some(channel) => Self::push(channel, bytes),
                None => tracing::debug!(client = c, "[bft] no channel for client"),
            },
        }
    }
}
