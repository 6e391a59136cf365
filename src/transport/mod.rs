//! # Transport Contract
//!
//! The protocol plane treats the substrate that actually carries encoded
//! frames between processes as an external collaborator (spec §1, §6): it
//! only needs one receiver per `(template, version)`, one client-initiated
//! channel per `(local peer, remote peer, version)` for messages and
//! another for data, observable/recoverable channel faults, and
//! at-least-once delivery per send attempt with the caller handling retry.
//!
//! This module defines that contract as traits (`ChannelTemplate`,
//! `MessageSender`, `DataSender`) and, since a crate with no working
//! substrate can't be exercised end to end, a concrete reference
//! implementation over TCP (`transport::tcp`) grounded on the teacher's
//! `ipc::tcp_socket::TcpSocketTransport`: a 4-byte little-endian length
//! prefix followed by a bincode-encoded payload, per direction.

pub mod tcp;
#[cfg(test)]
pub mod test_support;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::identity::{EndpointId, MessageId, ProtocolVersion};
use crate::wire::Frame;

/// A transport-level address. Transports that add further mechanisms
/// (Unix domain sockets, shared memory, …) extend this enum; the core
/// never interprets an `Address` itself beyond passing it to the
/// transport that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    Tcp(std::net::SocketAddr),
    /// Used only by the in-memory test substrate.
    Memory(u64),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "tcp://{addr}"),
            Address::Memory(id) => write!(f, "mem://{id}"),
        }
    }
}

/// Failures a transport can report. `Faulted` is the signal the Restoring
/// Channel watches for: it means the current channel is no longer usable
/// and must be re-created before the next attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel faulted: {0}")]
    Faulted(#[source] anyhow::Error),
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] anyhow::Error),
    #[error("remote did not acknowledge receipt")]
    NotAcknowledged,
}

/// Header carried ahead of a bulk byte stream on the data channel.
///
/// The sender is also present in the enclosing message's transport framing;
/// per this design's resolution of the corresponding open question, the
/// outer framing's sender is authoritative and a mismatch here is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataTransferHeader {
    pub sender: EndpointId,
    pub id: MessageId,
    pub length: u64,
}

/// One open outbound channel for framed messages to a single peer.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send one frame. `Ok(())` only when the transport accepted the bytes;
    /// the caller (Restoring Channel) is responsible for retry policy.
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Whether the underlying connection is still usable.
    fn is_open(&self) -> bool;
}

/// One open outbound channel for bulk data to a single peer.
#[async_trait]
pub trait DataSender: Send + Sync {
    /// Stream `length` bytes read from `body` to the peer, preceded by
    /// `header`. Returns `Ok(())` only once the remote has acknowledged
    /// receipt.
    async fn send_stream(
        &mut self,
        header: DataTransferHeader,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// Lets the Data Handler acknowledge (or reject) a completed inbound
/// stream back to the sender, whatever the underlying transport's
/// acknowledgement mechanism is.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>, ok: bool) -> Result<(), TransportError>;
}

/// An inbound bulk stream handed to the Data Handler.
pub struct IncomingStream {
    pub header: DataTransferHeader,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
    pub acker: Box<dyn Acker>,
}

/// The receiving half of one protocol version's presence on a template:
/// a message frame feed and a bulk-stream feed, plus the addresses peers
/// should dial to reach them.
pub struct ReceiverHost {
    pub message_address: Address,
    pub data_address: Address,
    pub messages: mpsc::Receiver<Frame>,
    pub data: mpsc::Receiver<IncomingStream>,
}

/// An abstract description of a transport family from which concrete
/// message and data channels are instantiated per protocol version.
#[async_trait]
pub trait ChannelTemplate: Send + Sync {
    /// Stand up a receiver host for `version`, listening wherever this
    /// template binds by default.
    async fn bind(&self, version: ProtocolVersion) -> Result<ReceiverHost, TransportError>;

    /// Open a fresh outbound message channel to `addr`.
    async fn open_message_sender(
        &self,
        addr: &Address,
    ) -> Result<Box<dyn MessageSender>, TransportError>;

    /// Open a fresh outbound data channel to `addr`.
    async fn open_data_sender(
        &self,
        addr: &Address,
    ) -> Result<Box<dyn DataSender>, TransportError>;
}
