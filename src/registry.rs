//! # Endpoint Registry
//!
//! Tracks the lifecycle of every peer this instance knows about: `Contacted`
//! once its address is known, `WaitingForApproval` once it has announced a
//! `ProtocolDescription` and a handshake is in flight, `Approved` once both
//! sides have agreed to talk, and `Absent` by simply not being present in
//! the map (spec §4.1, §3 "Endpoint lifecycle states").
//!
//! One entry per `EndpointId`, guarded by a single lock, consistent with
//! the teacher's "one mutex around one map" style in `coordination.rs` —
//! the concurrency model calls for a single writer per entry, which a
//! plain `Mutex<HashMap<_>>` gives for free as long as callers never hold
//! the guard across an `.await`, and signals fire only after it's released.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::identity::EndpointId;
use crate::model::{EndpointInformation, ProtocolDescription};

/// Where one peer currently sits in the handshake lifecycle.
#[derive(Debug, Clone)]
enum EndpointState {
    /// Address known, no description yet.
    Contacted(EndpointInformation),
    /// Description known, handshake in flight.
    WaitingForApproval(EndpointInformation, ProtocolDescription),
    /// Ready for traffic. Addresses are frozen from here on.
    Approved(EndpointInformation),
}

impl EndpointState {
    fn info(&self) -> &EndpointInformation {
        match self {
            EndpointState::Contacted(info) => info,
            EndpointState::WaitingForApproval(info, _) => info,
            EndpointState::Approved(info) => info,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Connected(EndpointId),
    Disconnecting(EndpointId),
    Disconnected(EndpointId),
}

struct Inner {
    entries: HashMap<EndpointId, EndpointState>,
}

/// The Endpoint Registry. Cheap to clone; all clones share the same map
/// and broadcast channel.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
            })),
            events,
        }
    }

    /// Subscribe to lifecycle transitions. Lagging subscribers silently
    /// miss old events rather than blocking publishers — signal delivery
    /// is best-effort, not a sequencing guarantee (spec §5).
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Record a newly contacted peer. Fails if the id is already known in
    /// any state — no silent update (spec §4.1).
    pub async fn try_add(&self, info: EndpointInformation) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.entries.contains_key(&info.id) {
            return false;
        }
        guard.entries.insert(info.id, EndpointState::Contacted(info));
        true
    }

    /// Move a `Contacted` peer to `WaitingForApproval`, attaching the
    /// description it announced. Only succeeds from `Contacted`.
    pub async fn try_start_approval(&self, id: EndpointId, desc: ProtocolDescription) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.entries.get(&id) {
            Some(EndpointState::Contacted(info)) => {
                let info = info.clone();
                guard
                    .entries
                    .insert(id, EndpointState::WaitingForApproval(info, desc));
                true
            }
            _ => false,
        }
    }

    /// Move a `WaitingForApproval` peer to `Approved`, firing `Connected`
    /// after the lock is released.
    pub async fn try_complete_approval(&self, id: EndpointId) -> bool {
        let moved = {
            let mut guard = self.inner.lock().await;
            match guard.entries.get(&id) {
                Some(EndpointState::WaitingForApproval(info, _)) => {
                    let info = info.clone();
                    guard.entries.insert(id, EndpointState::Approved(info));
                    true
                }
                _ => false,
            }
        };
        if moved {
            let _ = self.events.send(RegistryEvent::Connected(id));
        }
        moved
    }

    /// Replace the stored addresses for a `Contacted` or `WaitingForApproval`
    /// entry. Rejects updates to `Approved` entries — their addresses are
    /// frozen.
    pub async fn try_update(&self, info: EndpointInformation) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.entries.get(&info.id) {
            Some(EndpointState::Contacted(_)) => {
                guard.entries.insert(info.id, EndpointState::Contacted(info));
                true
            }
            Some(EndpointState::WaitingForApproval(_, desc)) => {
                let desc = desc.clone();
                guard
                    .entries
                    .insert(info.id, EndpointState::WaitingForApproval(info, desc));
                true
            }
            _ => false,
        }
    }

    /// Remove an entry outright, returning it to `Absent`. Fires
    /// `Disconnecting` before the removal and `Disconnected` after, outside
    /// the lock, exactly once for any starting state.
    pub async fn try_remove(&self, id: EndpointId) -> bool {
        let _ = self.events.send(RegistryEvent::Disconnecting(id));
        let removed = {
            let mut guard = self.inner.lock().await;
            guard.entries.remove(&id).is_some()
        };
        if removed {
            debug!("endpoint {id} removed from registry");
        }
        let _ = self.events.send(RegistryEvent::Disconnected(id));
        removed
    }

    /// The information stored for a peer in any state, if known.
    pub async fn connection_for(&self, id: EndpointId) -> Option<EndpointInformation> {
        let guard = self.inner.lock().await;
        guard.entries.get(&id).map(|state| state.info().clone())
    }

    pub async fn has_been_contacted(&self, id: EndpointId) -> bool {
        let guard = self.inner.lock().await;
        guard.entries.contains_key(&id)
    }

    pub async fn is_waiting_for_approval(&self, id: EndpointId) -> bool {
        let guard = self.inner.lock().await;
        matches!(
            guard.entries.get(&id),
            Some(EndpointState::WaitingForApproval(..))
        )
    }

    pub async fn can_communicate_with(&self, id: EndpointId) -> bool {
        let guard = self.inner.lock().await;
        matches!(guard.entries.get(&id), Some(EndpointState::Approved(_)))
    }

    /// The description attached to a `WaitingForApproval` entry, if any.
    pub async fn pending_description(&self, id: EndpointId) -> Option<ProtocolDescription> {
        let guard = self.inner.lock().await;
        match guard.entries.get(&id) {
            Some(EndpointState::WaitingForApproval(_, desc)) => Some(desc.clone()),
            _ => None,
        }
    }

    /// Every currently `Approved` endpoint id, snapshotted under the lock.
    pub async fn approved_ids(&self) -> Vec<EndpointId> {
        let guard = self.inner.lock().await;
        guard
            .entries
            .iter()
            .filter_map(|(id, state)| match state {
                EndpointState::Approved(_) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ProtocolVersion;
    use crate::model::{DiscoveryInformation, ProtocolInformation};
    use crate::transport::Address;

    fn sample_info(id: EndpointId) -> EndpointInformation {
        EndpointInformation {
            id,
            discovery: DiscoveryInformation {
                discovery_address: Address::Memory(1),
            },
            protocol: ProtocolInformation {
                version: ProtocolVersion::new(1, 0),
                message_address: Address::Memory(2),
                data_address: Address::Memory(3),
            },
        }
    }

    #[tokio::test]
    async fn lifecycle_progresses_contacted_to_approved() {
        let registry = Registry::new();
        let id = EndpointId::generate();
        assert!(registry.try_add(sample_info(id)).await);
        assert!(registry.has_been_contacted(id).await);
        assert!(!registry.can_communicate_with(id).await);

        let desc = ProtocolDescription::new(["chat".to_string()]);
        assert!(registry.try_start_approval(id, desc).await);
        assert!(registry.is_waiting_for_approval(id).await);

        assert!(registry.try_complete_approval(id).await);
        assert!(registry.can_communicate_with(id).await);
        assert!(!registry.is_waiting_for_approval(id).await);
    }

    #[tokio::test]
    async fn double_add_fails_and_leaves_original_stored() {
        let registry = Registry::new();
        let id = EndpointId::generate();
        assert!(registry.try_add(sample_info(id)).await);
        assert!(!registry.try_add(sample_info(id)).await);
        assert_eq!(registry.connection_for(id).await.unwrap().id, id);
    }

    #[tokio::test]
    async fn update_rejected_once_approved() {
        let registry = Registry::new();
        let id = EndpointId::generate();
        registry.try_add(sample_info(id)).await;
        registry
            .try_start_approval(id, ProtocolDescription::new(["chat".to_string()]))
            .await;
        registry.try_complete_approval(id).await;

        assert!(!registry.try_update(sample_info(id)).await);
    }

    #[tokio::test]
    async fn removal_clears_approval_and_fires_events_in_order() {
        let registry = Registry::new();
        let mut events = registry.subscribe();
        let id = EndpointId::generate();

        registry.try_add(sample_info(id)).await;
        registry
            .try_start_approval(id, ProtocolDescription::new(["chat".to_string()]))
            .await;
        registry.try_complete_approval(id).await;
        assert!(registry.try_remove(id).await);
        assert!(!registry.can_communicate_with(id).await);
        assert!(!registry.has_been_contacted(id).await);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], RegistryEvent::Connected(eid) if eid == id));
        assert!(matches!(seen[1], RegistryEvent::Disconnecting(eid) if eid == id));
        assert!(matches!(seen[2], RegistryEvent::Disconnected(eid) if eid == id));
    }

    #[tokio::test]
    async fn approval_cannot_complete_without_waiting_state() {
        let registry = Registry::new();
        let id = EndpointId::generate();
        assert!(!registry.try_complete_approval(id).await);
    }
}
