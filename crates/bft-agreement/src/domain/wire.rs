//! Wire format.
//!
//! Every message travels as an [`Envelope`]: a version, the sending
//! principal, one [`WireMessage`] variant and an authenticator over the
//! first three. Decoding happens once at the IPC boundary; the engine only
//! ever sees typed variants.

use super::messages::{
    Checkpoint, Commit, NewKey, NewView, PrePrepare, Prepare, Status, ViewChange, ViewChangeAck,
};
use super::request::{Reply, Request};
use serde::{Deserialize, Serialize};
use shared_types::{Authenticator, ClientId, CodecError, Principal, ReplicaId};
use std::fmt;

/// Envelope format version produced by this build.
pub const CURRENT_VERSION: u16 = 1;

/// Closed set of protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(Checkpoint),
    ViewChange(ViewChange),
    NewView(NewView),
    ViewChangeAck(ViewChangeAck),
    Status(Status),
    Reply(Reply),
    NewKey(NewKey),
}

/// Message kind, used for metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Request,
    PrePrepare,
    Prepare,
    Commit,
    Checkpoint,
    ViewChange,
    NewView,
    ViewChangeAck,
    Status,
    Reply,
    NewKey,
}

impl MessageTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTag::Request => "request",
            MessageTag::PrePrepare => "pre_prepare",
            MessageTag::Prepare => "prepare",
            MessageTag::Commit => "commit",
            MessageTag::Checkpoint => "checkpoint",
            MessageTag::ViewChange => "view_change",
            MessageTag::NewView => "new_view",
            MessageTag::ViewChangeAck => "view_change_ack",
            MessageTag::Status => "status",
            MessageTag::Reply => "reply",
            MessageTag::NewKey => "new_key",
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WireMessage {
    pub fn tag(&self) -> MessageTag {
        match self {
            WireMessage::Request(_) => MessageTag::Request,
            WireMessage::PrePrepare(_) => MessageTag::PrePrepare,
            WireMessage::Prepare(_) => MessageTag::Prepare,
            WireMessage::Commit(_) => MessageTag::Commit,
            WireMessage::Checkpoint(_) => MessageTag::Checkpoint,
            WireMessage::ViewChange(_) => MessageTag::ViewChange,
            WireMessage::NewView(_) => MessageTag::NewView,
            WireMessage::ViewChangeAck(_) => MessageTag::ViewChangeAck,
            WireMessage::Status(_) => MessageTag::Status,
            WireMessage::Reply(_) => MessageTag::Reply,
            WireMessage::NewKey(_) => MessageTag::NewKey,
        }
    }

    /// Principal the message claims to come from.
    ///
    /// Pre-prepares name no sender: the primary proposes them but any
    /// replica may relay one during a view change.
    pub fn claimed_sender(&self) -> Option<Principal> {
        let replica = |id: ReplicaId| Some(Principal::Replica(id));
        match self {
            WireMessage::Request(m) => Some(Principal::Client(m.client_id)),
            WireMessage::PrePrepare(_) => None,
            WireMessage::Prepare(m) => replica(m.sender),
            WireMessage::Commit(m) => replica(m.sender),
            WireMessage::Checkpoint(m) => replica(m.sender),
            WireMessage::ViewChange(m) => replica(m.sender),
            WireMessage::NewView(m) => replica(m.sender),
            WireMessage::ViewChangeAck(m) => replica(m.sender),
            WireMessage::Status(m) => replica(m.sender),
            WireMessage::Reply(m) => replica(m.sender),
            WireMessage::NewKey(m) => replica(m.sender),
        }
    }

    /// True if the message must carry a transferable signature.
    pub fn requires_signature(&self) -> bool {
        match self {
            WireMessage::NewView(_) | WireMessage::NewKey(_) => true,
            WireMessage::Checkpoint(c) => c.stable,
            _ => false,
        }
    }
}

/// Where an outbound envelope goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Replica(ReplicaId),
    AllReplicas,
    Client(ClientId),
}

/// A versioned, authenticated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub sender: Principal,
    pub message: WireMessage,
    pub auth: Authenticator,
}

#[derive(Serialize)]
struct SignedPart<'a> {
    version: u16,
    sender: &'a Principal,
    message: &'a WireMessage,
}

impl Envelope {
    /// Unauthenticated envelope at the current version.
    pub fn new(sender: Principal, message: WireMessage) -> Self {
        Self {
            version: CURRENT_VERSION,
            sender,
            message,
            auth: Authenticator::None,
        }
    }

    /// Bytes the authenticator covers.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(&SignedPart {
            version: self.version,
            sender: &self.sender,
            message: &self.message,
        })
        .map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode an envelope no larger than `max_size` bytes.
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self, CodecError> {
        if bytes.len() > max_size {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: max_size,
            });
        }
        let envelope: Envelope =
            bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        if envelope.version != CURRENT_VERSION {
            return Err(CodecError::UnsupportedVersion {
                received: envelope.version,
                supported: CURRENT_VERSION,
            });
        }
        Ok(envelope)
    }
}
