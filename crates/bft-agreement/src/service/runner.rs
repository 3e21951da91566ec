//! Async driver for one replica.
//!
//! Feeds inbound bytes through the [`IpcHandler`] and fires timers on a
//! fixed tick. The loop ends when every [`ReplicaHandle`] is dropped; the
//! replica is then shut down and its persisted state returned.

use crate::error::{AgreementError, AgreementResult};
use crate::ipc::IpcHandler;
use crate::ports::ReplicaApi;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Inbound queue depth per replica.
const INBOUND_CAPACITY: usize = 1024;

/// Cloneable sender of raw envelopes to a running replica.
#[derive(Clone)]
pub struct ReplicaHandle {
    sender: mpsc::Sender<Vec<u8>>,
}

impl ReplicaHandle {
    /// Queue `bytes` for the replica.
    pub async fn submit(&self, bytes: Vec<u8>) -> AgreementResult<()> {
        self.sender
            .send(bytes)
            .await
            .map_err(|_| AgreementError::ServiceStopped)
    }

    /// Raw channel, for wiring into a [`ChannelTransport`](crate::adapters::ChannelTransport).
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.sender.clone()
    }
}

/// Event loop of one replica.
pub struct ReplicaRunner<R: ReplicaApi> {
    handler: IpcHandler<R>,
    inbound: mpsc::Receiver<Vec<u8>>,
    tick_interval: Duration,
}

impl<R: ReplicaApi> ReplicaRunner<R> {
    pub fn new(
        service: Arc<R>,
        max_message_size: usize,
        tick_interval: Duration,
    ) -> (Self, ReplicaHandle) {
        let (sender, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let runner = Self {
            handler: IpcHandler::new(service, max_message_size),
            inbound,
            tick_interval,
        };
        (runner, ReplicaHandle { sender })
    }

    /// Run until every handle is dropped, then shut the replica down.
    pub async fn run(mut self) -> AgreementResult<Vec<u8>> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("[bft] replica runner started");

        loop {
            tokio::select! {
                received = self.inbound.recv() => match received {
                    Some(bytes) => {
                        if let Err(e) = self.handler.handle_bytes(&bytes).await {
                            debug!(error = %e, "[bft] inbound message rejected");
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let service = self.handler.service();
                    if let Err(e) = service.tick().await {
                        warn!(error = %e, "[bft] timer tick failed");
                        break;
                    }
                    service.poll_state_sync().await?;
                }
            }
        }

        info!("[bft] replica runner stopping");
        self.handler.service().shutdown().await
    }
}
