//! Shared handle implementing the inbound API.

use super::Replica;
use crate::domain::Envelope;
use crate::error::AgreementResult;
use crate::events::ReplicaEvent;
use crate::ports::{Application, CryptoService, ReplicaApi, ReplicaStatus, StateSync, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Thread-safe wrapper serializing every call into one [`Replica`].
pub struct ReplicaService<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    replica: Arc<Mutex<Replica<T, C, S, A>>>,
}

impl<T, C, S, A> Clone for ReplicaService<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    fn clone(&self) -> Self {
        Self {
            replica: Arc::clone(&self.replica),
        }
    }
}

impl<T, C, S, A> ReplicaService<T, C, S, A>
where
    T: Transport,
    C: CryptoService,
    S: StateSync,
    A: Application,
{
    pub fn new(replica: Replica<T, C, S, A>) -> Self {
        Self {
            replica: Arc::new(Mutex::new(replica)),
        }
    }

    /// Run `f` with exclusive access to the replica.
    pub fn with_replica<R>(&self, f: impl FnOnce(&mut Replica<T, C, S, A>) -> R) -> R {
        f(&mut self.replica.lock())
    }

    pub fn drain_events(&self) -> Vec<ReplicaEvent> {
        self.replica.lock().drain_events()
    }
}

#[async_trait]
impl<T, C, S, A> ReplicaApi for ReplicaService<T, C, S, A>
where
    T: Transport + 'static,
    C: CryptoService + 'static,
    S: StateSync + 'static,
    A: Application + 'static,
{
    async fn deliver(&self, envelope: Envelope) -> AgreementResult<()> {
        self.replica.lock().deliver(envelope)
    }

    async fn tick(&self) -> AgreementResult<()> {
        self.replica.lock().tick()
    }

    async fn poll_state_sync(&self) -> AgreementResult<()> {
        self.replica.lock().poll_state_sync()
    }

    async fn snapshot(&self) -> AgreementResult<ReplicaStatus> {
        let replica = self.replica.lock();
        replica.ensure_running()?;
        Ok(replica.snapshot())
    }

    async fn shutdown(&self) -> AgreementResult<Vec<u8>> {
        self.replica.lock().shutdown()
    }
}
