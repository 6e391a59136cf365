//! # Peerway
//!
//! A peer-to-peer protocol runtime: endpoint lifecycle tracking, handshake
//! negotiation, message routing with response correlation, bulk data
//! transfer, and keep-alive liveness monitoring, over a pluggable
//! transport. The reference transport (`transport::tcp`) speaks a small
//! length-prefixed, bincode-encoded framing over TCP; anything implementing
//! `transport::ChannelTemplate` can stand in for it.
//!
//! Start at [`protocol::Protocol`] — it composes every other module behind
//! one façade: `open`/`close` a local endpoint, `connect_to` a peer,
//! `send_to`/`send_and_wait` frames, `transfer_data` files, and
//! `verify_connection` on demand.

pub mod channel;
pub mod completion;
pub mod config;
pub mod data_handler;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod logging;
pub mod message_handler;
pub mod model;
pub mod monitor;
pub mod protocol;
pub mod protocol_channel;
pub mod registry;
pub mod sending;
pub mod transport;
pub mod wire;

pub use completion::{Completer, Completion, Outcome};
pub use config::ProtocolConfig;
pub use error::{ProtocolError, Result};
pub use handshake::{ApprovalPolicy, HandshakeConductor, IntersectingPolicy};
pub use identity::{highest_common_version, EndpointId, MessageId, ProtocolVersion};
pub use message_handler::{Disposition, FilterAction, FilterPredicate};
pub use model::{DiscoveryInformation, EndpointInformation, ProtocolDescription, ProtocolInformation};
pub use protocol::{DataRequestResolver, Protocol};
pub use registry::{Registry, RegistryEvent};
pub use transport::{Address, ChannelTemplate};
pub use wire::{Frame, FrameBody};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
