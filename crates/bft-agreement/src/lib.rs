//! # bft-agreement
//!
//! Practical Byzantine fault tolerant agreement for a replicated service.
//!
//! ## Architecture
//!
//! N = 3f+1 replicas order client requests so every correct replica executes
//! the same sequence, despite up to f arbitrary faults.
//!
//! ```text
//! Client ──Request──→ Primary ──PrePrepare──→ Backups
//!                                  │
//!                 Prepare (2f) ──→ prepared ──→ Commit (2f+1) ──→ execute
//!                                  │
//!       every checkpoint_interval: Checkpoint (2f+1) ──→ stable, log truncated
//! ```
//!
//! When the primary stalls, backups time out and move to the next view.
//! The view-change coordinator picks, for each sequence number in the
//! window, the request that may have committed, and the new primary
//! re-proposes exactly those.
//!
//! ### Hexagonal layout
//!
//! - [`domain`]: pure protocol state (certificates, logs, view change)
//! - [`service`]: the engine, one single-writer [`Replica`] per replica
//! - [`ports`]: transport, crypto, state transfer, application and clock
//! - [`adapters`]: in-process implementations of the ports
//! - [`ipc`]: byte decoding in front of the engine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bft_agreement::{Replica, ReplicaDependencies, ReplicaService, ReplicaConfig};
//!
//! let replica = Replica::new(id, ReplicaDependencies { transport, crypto, state, app, config })?;
//! let service = Arc::new(ReplicaService::new(replica));
//! let (runner, handle) = ReplicaRunner::new(service, config.max_message_size, tick);
//! tokio::spawn(runner.run());
//! handle.submit(bytes).await?;
//! ```
//!
//! ## Security
//!
//! - Every inbound envelope is authenticated before any handler runs
//! - Point-to-point traffic carries MAC vectors; relayable messages
//!   (new-views, stable checkpoints, key announcements) are signed
//! - Session keys rotate periodically

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod ipc;
pub mod metrics;
pub mod ports;
pub mod service;

// Re-export main types
pub use adapters::{
    ChannelTransport, InMemoryStateSync, KeyRingCrypto, KvApplication, KvCommand, KvStore,
    ManualClock, RecordingTransport, SharedCheckpointStore,
};
pub use config::{ExecutionPolicy, ReplicaConfig};
pub use domain::{ClientSession, Destination, Envelope, QuorumParams, WireMessage};
pub use error::{AgreementError, AgreementResult};
pub use events::ReplicaEvent;
pub use ipc::IpcHandler;
pub use ports::{
    Application, Clock, CryptoService, ReplicaApi, ReplicaStatus, StateSync, SystemClock,
    Transport,
};
pub use service::{
    PersistedReplica, Replica, ReplicaDependencies, ReplicaHandle, ReplicaRunner, ReplicaService,
};
