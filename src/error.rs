//! # Protocol Error Taxonomy
//!
//! The protocol plane distinguishes a handful of failure kinds that callers
//! of the public façade (`protocol::Protocol`) need to match on, the
//! same way a messaging protocol's dial/send path exposes a small closed
//! set of failure reasons rather than an opaque error. Plumbing failures
//! that cross a boundary the caller doesn't need to branch on (I/O,
//! (de)serialization) are carried as `anyhow::Error` instead, matching how
//! the rest of this codebase uses `anyhow` at transport boundaries.

use thiserror::Error;

use crate::identity::EndpointId;

/// Caller-facing failure kinds for the protocol plane.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The transport refused the send or every retry attempt failed.
    #[error("send to {peer} failed after {attempts} attempt(s): {source}")]
    SendFailed {
        peer: EndpointId,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// No sender exists for the target endpoint; the caller must re-discover it.
    #[error("endpoint {0} is not contactable")]
    EndpointNotContactable(EndpointId),

    /// A response or probe waiter expired before completion.
    #[error("waiter timed out")]
    Timeout,

    /// A response or probe waiter was cancelled (peer sign-off, local shutdown, explicit).
    #[error("waiter was cancelled")]
    Cancelled,

    /// Discovery surfaced a peer with no protocol version in common.
    #[error("no protocol version in common with {0}")]
    VersionMismatch(EndpointId),

    /// Attempted to re-register an id/filter/serializer that is already known.
    #[error("duplicate registration")]
    DuplicateRegistration,

    /// A receiver host has faulted too many times in too short a window.
    #[error("receiver host for version {0:?} exceeded its restart budget")]
    MaxRestarts(crate::identity::ProtocolVersion),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
