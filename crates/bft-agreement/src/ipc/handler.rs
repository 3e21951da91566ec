//! IPC Handler
//!
//! Decodes inbound byte strings into [`Envelope`]s and hands them to the
//! replica. Authentication happens inside the engine, which knows the
//! session keys; this layer only enforces size and version.

use crate::domain::Envelope;
use crate::error::AgreementResult;
use crate::ports::ReplicaApi;
use bft_telemetry::{time_histogram, DECODE_FAILURES, MESSAGES_RECEIVED, MESSAGE_HANDLING_DURATION};
use std::sync::Arc;

/// IPC Handler for one replica
pub struct IpcHandler<R: ReplicaApi> {
    service: Arc<R>,
    max_message_size: usize,
}

impl<R: ReplicaApi> IpcHandler<R> {
    pub fn new(service: Arc<R>, max_message_size: usize) -> Self {
        Self {
            service,
            max_message_size,
        }
    }

    pub fn service(&self) -> &Arc<R> {
        &self.service
    }

    /// Decode `bytes` and deliver the envelope.
    ///
    /// # Errors
    /// - `Codec` if the bytes are oversized, malformed or of another version
    /// - whatever the replica returns for the envelope
    pub async fn handle_bytes(&self, bytes: &[u8]) -> AgreementResult<()> {
        let _timer = time_histogram!(MESSAGE_HANDLING_DURATION);

        let envelope = match Envelope::decode(bytes, self.max_message_size) {
            Ok(envelope) => envelope,
            Err(e) => {
                DECODE_FAILURES.inc();
                tracing::debug!(size = bytes.len(), error = %e, "[bft] undecodable message");
                return Err(e.into());
            }
        };
        MESSAGES_RECEIVED
            .with_label_values(&[envelope.message.tag().as_str()])
            .inc();

        self.service.deliver(envelope).await
    }
}
