//! Outgoing events

use serde::{Deserialize, Serialize};
use shared_types::{ClientId, Digest, RequestId, Seqno, View};

/// Milestone reached by a replica.
///
/// Recorded in order of occurrence and drained with `Replica::drain_events`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaEvent {
    /// The batch at `seqno` executed and committed.
    Executed {
        seqno: Seqno,
        /// Digest of the pre-prepare that was executed
        digest: Digest,
        /// Requests in batch order; empty for a null request
        requests: Vec<(ClientId, RequestId)>,
    },
    /// A checkpoint gathered a quorum and the log moved past it.
    CheckpointStable { seqno: Seqno },
    /// This replica sent a view-change for `view`.
    ViewChangeStarted { view: View },
    /// The new view was adopted; `(min, max)` were re-proposed.
    NewViewInstalled { view: View, min: Seqno, max: Seqno },
    /// A state fetch began; `None` fetches the latest available state.
    StateFetchStarted { target: Option<Seqno> },
    /// Fetched state at `seqno` was adopted.
    StateFetched { seqno: Seqno },
}

impl ReplicaEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaEvent::Executed { .. } => "executed",
            ReplicaEvent::CheckpointStable { .. } => "checkpoint_stable",
            ReplicaEvent::ViewChangeStarted { .. } => "view_change_started",
            ReplicaEvent::NewViewInstalled { .. } => "new_view_installed",
            ReplicaEvent::StateFetchStarted { .. } => "state_fetch_started",
            ReplicaEvent::StateFetched { .. } => "state_fetched",
        }
    }
}
