//! # Identity & Addressing
//!
//! Stable identifiers used throughout the protocol plane. `EndpointId` is
//! generated once per process and never reused; `MessageId` tags every
//! outgoing message so responses can be correlated back to their request;
//! `ProtocolVersion` is the ordered tuple two peers negotiate down to their
//! highest common generation of the wire format.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, process-global identifier for one addressable peer.
///
/// Stable for the lifetime of the owning process; never reused across
/// restarts (a fresh `EndpointId` is minted each time a process starts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(Uuid);

impl EndpointId {
    /// Mint a fresh, process-global identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique token attached to every outgoing message.
///
/// Carried in the wire header's `in_response_to` field (as `Option<MessageId>`)
/// to correlate a reply with the request that triggered it; `None` there
/// means "this frame is not a response to anything".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A discrete, ordered protocol generation: `(major, minor)`.
///
/// Two peers negotiate down to the highest version both support; ordering
/// is lexicographic on `(major, minor)`, so `ProtocolVersion::new(2, 0) >
/// ProtocolVersion::new(1, 9)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// The highest version present in both `ours` and `theirs`, if any.
pub fn highest_common_version(
    ours: &[ProtocolVersion],
    theirs: &[ProtocolVersion],
) -> Option<ProtocolVersion> {
    ours.iter()
        .filter(|v| theirs.contains(v))
        .max()
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_ids_are_distinct_per_generation() {
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn version_ordering_is_lexicographic() {
        assert!(ProtocolVersion::new(2, 0) > ProtocolVersion::new(1, 9));
        assert!(ProtocolVersion::new(1, 2) > ProtocolVersion::new(1, 1));
    }

    #[test]
    fn highest_common_version_picks_max_intersection() {
        let ours = vec![ProtocolVersion::new(1, 0), ProtocolVersion::new(2, 0)];
        let theirs = vec![ProtocolVersion::new(2, 0), ProtocolVersion::new(3, 0)];
        assert_eq!(
            highest_common_version(&ours, &theirs),
            Some(ProtocolVersion::new(2, 0))
        );
    }

    #[test]
    fn highest_common_version_none_when_disjoint() {
        let ours = vec![ProtocolVersion::new(1, 0)];
        let theirs = vec![ProtocolVersion::new(2, 0)];
        assert_eq!(highest_common_version(&ours, &theirs), None);
    }
}
