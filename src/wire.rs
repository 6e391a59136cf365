//! # Wire Frames
//!
//! Every frame shares a header of `{ sender, id, in_response_to }` plus a
//! type-tagged body (spec §6, §9 "tagged variants over type-based
//! dispatch"). Routing is a match on the tag; there is no runtime
//! type-table lookup the way a class-hierarchy design would need.
//!
//! Frames round-trip through `bincode`, the same binary codec the teacher
//! uses for its own wire `Message` type.

use serde::{Deserialize, Serialize};

use crate::identity::{EndpointId, MessageId};
use crate::model::{EndpointInformation, ProtocolDescription, ProtocolInformation};

/// Fields present on every frame, regardless of body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    pub sender: EndpointId,
    pub id: MessageId,
    pub in_response_to: Option<MessageId>,
}

/// The type-tagged frame body. See spec §6 for the wire frame table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FrameBody {
    /// Initiate a handshake.
    EndpointConnect {
        protocol: ProtocolInformation,
        discovery: crate::model::DiscoveryInformation,
        description: ProtocolDescription,
    },
    /// Reply in a handshake.
    EndpointConnectResponse {
        info: EndpointInformation,
        accepted: bool,
    },
    /// The peer is going away.
    EndpointDisconnect,
    /// Keep-alive probe.
    ConnectionVerification { payload: Option<Vec<u8>> },
    /// Keep-alive probe reply.
    ConnectionVerificationResponse { payload: Option<Vec<u8>> },
    /// "Please stream me this" — paired with a `DataTransferHeader` on the
    /// data channel.
    DataDownloadRequest {
        token: MessageId,
        target_hint: String,
    },
    /// Generic positive acknowledgement.
    Success,
    /// Generic negative acknowledgement.
    Failure { reason: String },
    /// "I don't know that frame type."
    UnknownMessageType,
}

impl FrameBody {
    /// Whether this body is part of the handshake exchange — handshake
    /// frames are admitted from peers that are not yet `Approved`
    /// (spec §4.4 admission filter).
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            FrameBody::EndpointConnect { .. } | FrameBody::EndpointConnectResponse { .. }
        )
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, FrameBody::EndpointDisconnect)
    }
}

/// A complete wire frame: header plus body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(sender: EndpointId, in_response_to: Option<MessageId>, body: FrameBody) -> Self {
        Self {
            header: FrameHeader {
                sender,
                id: MessageId::generate(),
                in_response_to,
            },
            body,
        }
    }

    /// Build a reply frame addressed back at whatever sent `self`.
    pub fn reply(&self, sender: EndpointId, body: FrameBody) -> Self {
        Self::new(sender, Some(self.header.id), body)
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
