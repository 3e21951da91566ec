//! Driving ports (Inbound API)

use crate::domain::Envelope;
use crate::error::AgreementResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::{ReplicaId, Seqno, View};

/// Point-in-time view of a replica's protocol markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub id: ReplicaId,
    pub view: View,
    /// Between sending a view-change and entering the new view.
    pub limbo: bool,
    /// True once the replica may act in `view`.
    pub has_new_view: bool,
    pub seqno: Seqno,
    pub last_stable: Seqno,
    pub last_prepared: Seqno,
    pub last_executed: Seqno,
    pub last_tentative_execute: Seqno,
    pub queued_requests: usize,
    pub fetching_state: bool,
}

/// Primary agreement API
///
/// All calls are serialized: the replica handles one input to completion
/// before looking at the next.
#[async_trait]
pub trait ReplicaApi: Send + Sync {
    /// Handle one authenticated envelope from a peer or client.
    async fn deliver(&self, envelope: Envelope) -> AgreementResult<()>;

    /// Fire expired timers (view change, status, key rotation).
    async fn tick(&self) -> AgreementResult<()>;

    /// Finish a background state transfer if one completed.
    async fn poll_state_sync(&self) -> AgreementResult<()>;

    /// Current protocol markers.
    async fn snapshot(&self) -> AgreementResult<ReplicaStatus>;

    /// Stop the replica and return its persisted state.
    ///
    /// Later calls fail with `ServiceStopped`.
    async fn shutdown(&self) -> AgreementResult<Vec<u8>>;
}
