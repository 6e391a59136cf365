//! # Handshake Conductor
//!
//! Drives the two-party negotiation state machine to approval or
//! rejection (spec §4.6). Either side may initiate; the conductor folds a
//! concurrent or duplicate initiation from the same peer into the
//! existing attempt rather than starting a second one, so `try_add`
//! returning false is "already known", not an error (spec §9 "concurrent
//! handshake initiation").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::identity::{highest_common_version, EndpointId, ProtocolVersion};
use crate::model::{DiscoveryInformation, EndpointInformation, ProtocolDescription, ProtocolInformation};
use crate::registry::Registry;
use crate::sending::SendingEndpoint;
use crate::wire::{Frame, FrameBody};

/// Per-peer handshake progress. `None` is implicit (no entry in the map).
/// Each side fills in `our_accept` only once it has actually seen the
/// peer's `ProtocolDescription` (from an `EndpointConnect`, never from a
/// `EndpointConnectResponse`, which carries no description); `their_accept`
/// comes from the peer's response to whichever connect frame we sent them.
/// The handshake resolves the moment both are known.
#[derive(Debug, Clone, Copy)]
struct HandshakeState {
    started_at: Instant,
    our_accept: Option<bool>,
    their_accept: Option<bool>,
}

impl HandshakeState {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            our_accept: None,
            their_accept: None,
        }
    }
}

/// Decides, for a peer's announced capabilities, whether connecting is
/// worthwhile: version intersection is non-empty and the local policy
/// accepts the peer's `ProtocolDescription`.
pub trait ApprovalPolicy: Send + Sync {
    fn accepts(&self, description: &ProtocolDescription) -> bool;
}

/// Accepts any peer whose description intersects this instance's own.
pub struct IntersectingPolicy {
    pub local: ProtocolDescription,
}

impl ApprovalPolicy for IntersectingPolicy {
    fn accepts(&self, description: &ProtocolDescription) -> bool {
        self.local.intersects(description)
    }
}

/// Drives handshakes for one local endpoint. Holds the state of every
/// in-flight negotiation; completed handshakes live only in the
/// `Registry`, not here.
pub struct HandshakeConductor {
    local_id: EndpointId,
    local_versions: Vec<ProtocolVersion>,
    local_description: ProtocolDescription,
    local_discovery: DiscoveryInformation,
    local_protocol_by_version: Mutex<HashMap<ProtocolVersion, ProtocolInformation>>,
    registry: Arc<Registry>,
    sending: Arc<SendingEndpoint>,
    policy: Arc<dyn ApprovalPolicy>,
    timeout: Duration,
    in_flight: Mutex<HashMap<EndpointId, HandshakeState>>,
}

impl HandshakeConductor {
    pub fn new(
        local_id: EndpointId,
        local_discovery: DiscoveryInformation,
        local_description: ProtocolDescription,
        local_protocol_by_version: HashMap<ProtocolVersion, ProtocolInformation>,
        registry: Arc<Registry>,
        sending: Arc<SendingEndpoint>,
        policy: Arc<dyn ApprovalPolicy>,
        timeout: Duration,
    ) -> Self {
        let local_versions = local_protocol_by_version.keys().copied().collect();
        Self {
            local_id,
            local_versions,
            local_description,
            local_discovery,
            local_protocol_by_version: Mutex::new(local_protocol_by_version),
            registry,
            sending,
            policy,
            timeout,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Initiate a handshake with a peer discovered at `discovery`, at a
    /// protocol version chosen once both sides' version lists intersect.
    /// Idempotent: a second initiation for a peer already in flight is
    /// folded into the existing attempt.
    pub async fn initiate(&self, peer: EndpointId, discovery: DiscoveryInformation) {
        let mut guard = self.in_flight.lock().await;
        if guard.contains_key(&peer) {
            debug!("handshake with {peer} already in flight, folding duplicate initiation");
            return;
        }
        // Address is not yet known at the protocol layer (only the
        // discovery endpoint is); the registry entry records the
        // discovery address immediately and the protocol address once
        // the peer's information frame arrives, via `try_update`.
        let placeholder = EndpointInformation {
            id: peer,
            discovery: discovery.clone(),
            protocol: self.any_protocol_information().await,
        };
        if !self.registry.try_add(placeholder).await {
            debug!("peer {peer} already known to registry, not re-initiating");
            return;
        }
        guard.insert(peer, HandshakeState::new());
        drop(guard);

        self.send_connect(peer, &discovery).await;
    }

    /// Entry point for an inbound `EndpointConnect`/`EndpointConnectResponse`
    /// frame. Returns `true` if the frame was handshake traffic this
    /// conductor consumed.
    pub async fn on_frame(&self, frame: &Frame) -> bool {
        match &frame.body {
            FrameBody::EndpointConnect {
                protocol,
                discovery,
                description,
            } => {
                self.on_connect(frame, protocol, discovery, description).await;
                true
            }
            FrameBody::EndpointConnectResponse { info, accepted } => {
                self.on_connect_response(frame.header.sender, info, *accepted)
                    .await;
                true
            }
            _ => false,
        }
    }

    /// Handle an inbound `EndpointConnect`. The sender's description
    /// arrives here and only here, so this is where we make our real
    /// accept/reject decision about them and store it as `our_accept`.
    ///
    /// The first time we hear from a peer this way, we mirror their
    /// initiation by sending our own outbound `EndpointConnect` right back
    /// (spec §4.6 bullet 1: "on inbound connect frame referencing a new
    /// peer ... send the outbound connect frame"). Without this, a purely
    /// passive responder never learns the initiator's accept bit and so
    /// never reaches `Approved` itself — only the initiator would. A
    /// concurrent double-initiation (both sides call `initiate` before
    /// either frame arrives) skips the mirror, since `already_started` is
    /// already true from our own `initiate` call, so no connect ping-pong.
    async fn on_connect(
        &self,
        incoming: &Frame,
        protocol: &ProtocolInformation,
        discovery: &DiscoveryInformation,
        description: &ProtocolDescription,
    ) {
        let peer = incoming.header.sender;
        let info = EndpointInformation {
            id: peer,
            discovery: discovery.clone(),
            protocol: protocol.clone(),
        };

        if self.registry.can_communicate_with(peer).await {
            // A retransmitted or duplicate connect for a peer that already
            // converged: answer it so a peer that's still waiting on a
            // dropped response sees one, but don't resurrect an in-flight
            // entry for an already-`Approved` peer — that would leave it
            // sitting in `in_flight` until `expire_stale` wrongly evicted
            // an otherwise healthy connection.
            let local_info = self.local_endpoint_information(protocol.version).await;
            let response = incoming.reply(
                self.local_id,
                FrameBody::EndpointConnectResponse {
                    info: local_info,
                    accepted: true,
                },
            );
            self.send_frame_best_effort(peer, &info.protocol, response).await;
            return;
        }

        let mut guard = self.in_flight.lock().await;
        let already_started = guard.contains_key(&peer);
        if !already_started {
            let _ = self.registry.try_add(info.clone()).await;
            guard.insert(peer, HandshakeState::new());
        }
        drop(guard);

        let version_ok = highest_common_version(&self.local_versions, std::slice::from_ref(&protocol.version))
            .is_some();
        let accept = version_ok && self.policy.accepts(description);

        self.registry
            .try_start_approval(peer, description.clone())
            .await;

        let local_info = self.local_endpoint_information(protocol.version).await;
        let response = incoming.reply(
            self.local_id,
            FrameBody::EndpointConnectResponse {
                info: local_info,
                accepted: accept,
            },
        );
        self.send_frame_best_effort(peer, &info.protocol, response).await;

        if !already_started {
            self.send_connect(peer, discovery).await;
        }

        let resolved = {
            let mut guard = self.in_flight.lock().await;
            let state = guard.entry(peer).or_insert_with(HandshakeState::new);
            state.our_accept = Some(accept);
            state.their_accept.map(|their_accept| (accept, their_accept))
        };

        match resolved {
            Some((true, true)) => self.approve(peer).await,
            Some(_) => self.reject(peer).await,
            None if !accept => self.reject(peer).await,
            None => {}
        }
    }

    /// Handle an inbound `EndpointConnectResponse`: records the peer's
    /// accept bit as `their_accept`. Resolves the handshake only once our
    /// own accept decision (`our_accept`, made in `on_connect` from the
    /// peer's actual description) is also known.
    async fn on_connect_response(&self, peer: EndpointId, info: &EndpointInformation, accepted: bool) {
        self.registry.try_update(info.clone()).await;

        let resolved = {
            let mut guard = self.in_flight.lock().await;
            match guard.get_mut(&peer) {
                Some(state) => {
                    state.their_accept = Some(accepted);
                    state.our_accept.map(|our_accept| (our_accept, accepted))
                }
                None => None,
            }
        };

        match resolved {
            Some((true, true)) => self.approve(peer).await,
            Some(_) => self.reject(peer).await,
            None => {}
        }
    }

    /// Complete approval. By the time both `our_accept` and `their_accept`
    /// are known, `on_connect` has always already run for this peer (it's
    /// the only place either side learns the other's real description), so
    /// the registry entry is already `WaitingForApproval` here.
    async fn approve(&self, peer: EndpointId) {
        if self.registry.try_complete_approval(peer).await {
            info!("handshake with {peer} approved");
        }
        self.in_flight.lock().await.remove(&peer);
    }

    async fn reject(&self, peer: EndpointId) {
        self.registry.try_remove(peer).await;
        self.in_flight.lock().await.remove(&peer);
    }

    async fn send_connect(&self, peer: EndpointId, discovery: &DiscoveryInformation) {
        let version = self.local_versions.iter().copied().max();
        let Some(version) = version else {
            debug!("no local protocol versions configured, cannot initiate handshake");
            return;
        };
        let local_info = self.local_endpoint_information(version).await;
        let connect = Frame::new(
            self.local_id,
            None,
            FrameBody::EndpointConnect {
                protocol: local_info.protocol.clone(),
                discovery: local_info.discovery.clone(),
                description: self.local_description.clone(),
            },
        );
        let placeholder_protocol = ProtocolInformation {
            version,
            message_address: discovery.discovery_address.clone(),
            data_address: discovery.discovery_address.clone(),
        };
        self.send_frame_best_effort(peer, &placeholder_protocol, connect).await;
    }

    async fn send_frame_best_effort(&self, peer: EndpointId, protocol: &ProtocolInformation, frame: Frame) {
        if let Err(e) = self.sending.send(peer, protocol, &frame, 1).await {
            debug!("best-effort handshake send to {peer} failed: {e}");
        }
    }

    async fn local_endpoint_information(&self, version: ProtocolVersion) -> EndpointInformation {
        EndpointInformation {
            id: self.local_id,
            discovery: self.local_discovery.clone(),
            protocol: self.any_protocol_information_for(version).await,
        }
    }

    async fn any_protocol_information(&self) -> ProtocolInformation {
        match self.local_versions.iter().copied().max() {
            Some(v) => self.any_protocol_information_for(v).await,
            None => ProtocolInformation {
                version: ProtocolVersion::new(0, 0),
                message_address: self.local_discovery.discovery_address.clone(),
                data_address: self.local_discovery.discovery_address.clone(),
            },
        }
    }

    async fn any_protocol_information_for(&self, version: ProtocolVersion) -> ProtocolInformation {
        self.local_protocol_by_version
            .lock()
            .await
            .get(&version)
            .cloned()
            .unwrap_or(ProtocolInformation {
                version,
                message_address: self.local_discovery.discovery_address.clone(),
                data_address: self.local_discovery.discovery_address.clone(),
            })
    }

    /// Overwrite the published `ProtocolInformation` for `version` once the
    /// real bound addresses are known, e.g. after a `Protocol Channel` binds
    /// an OS-assigned port. Handshakes initiated before this call still use
    /// the discovery-address placeholder; anything initiated after uses the
    /// real address.
    pub async fn publish_local_protocol_information(&self, version: ProtocolVersion, info: ProtocolInformation) {
        self.local_protocol_by_version.lock().await.insert(version, info);
    }

    /// Reject any handshake that has been in flight longer than `timeout`
    /// (spec §4.6 "timeout at any state rejects"). Called periodically by
    /// `spawn_timeout_loop`.
    pub async fn expire_stale(&self) {
        let stale: Vec<EndpointId> = {
            let guard = self.in_flight.lock().await;
            guard
                .iter()
                .filter(|(_, state)| state.started_at.elapsed() >= self.timeout)
                .map(|(peer, _)| *peer)
                .collect()
        };
        for peer in stale {
            debug!("handshake with {peer} timed out before converging, rejecting");
            self.reject(peer).await;
        }
    }

    /// Spawn the background loop that calls `expire_stale` on a tick.
    /// Aborted by the owning `Protocol` on `close()`.
    pub fn spawn_timeout_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let conductor = self.clone();
        let period = (self.timeout / 4).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                conductor.expire_stale().await;
            }
        })
    }
}
