//! # Data Model
//!
//! The value types exchanged between the handshake conductor, the
//! registry and the wire frames: the addresses a peer can be reached at
//! (`ProtocolInformation`, `DiscoveryInformation`), the identity/address
//! bundle the registry stores once a peer is known (`EndpointInformation`),
//! and the abstract capability set two peers compare to decide whether
//! connecting is mutually useful (`ProtocolDescription`).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::identity::{EndpointId, ProtocolVersion};
use crate::transport::Address;

/// Where to reach a peer for framed messages and for bulk data, at a
/// specific negotiated protocol version. Message and data channels are
/// addressed separately because they carry different QoS expectations
/// (small, latency-sensitive frames vs. large, throughput-sensitive
/// streams).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInformation {
    pub version: ProtocolVersion,
    pub message_address: Address,
    pub data_address: Address,
}

/// Bootstrap-only address: where a peer's discovery endpoint lives, used
/// to initiate first contact before any protocol version is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryInformation {
    pub discovery_address: Address,
}

/// Everything the registry knows about a peer once it has been contacted.
/// Immutable after the peer reaches `Approved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInformation {
    pub id: EndpointId,
    pub discovery: DiscoveryInformation,
    pub protocol: ProtocolInformation,
}

/// The abstract capabilities a peer offers. Two peers are mutually useful
/// to connect when their subject sets intersect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescription {
    pub subjects: BTreeSet<String>,
}

impl ProtocolDescription {
    pub fn new(subjects: impl IntoIterator<Item = String>) -> Self {
        Self {
            subjects: subjects.into_iter().collect(),
        }
    }

    /// Whether this description and `other` share at least one subject.
    pub fn intersects(&self, other: &ProtocolDescription) -> bool {
        self.subjects.intersection(&other.subjects).next().is_some()
    }
}
