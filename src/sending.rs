//! # Sending Endpoint
//!
//! Per local endpoint, holds a mapping from peer `ProtocolInformation` to a
//! pair of lazily-created channels: one `RestoringMessageChannel` for
//! frames, one `RestoringDataChannel` for bulk streams (spec §4.2).
//! `close_channel_to` drops both sides after releasing their resources.
//! Open/close is serialized per peer; concurrent sends to the same peer
//! serialize on channel creation but parallelize on transmit once the
//! channel exists, since the pool lock is only held long enough to clone
//! or insert an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::channel::{RestoringDataChannel, RestoringMessageChannel, RewindableBody};
use crate::error::Result;
use crate::identity::EndpointId;
use crate::model::ProtocolInformation;
use crate::transport::{ChannelTemplate, DataTransferHeader};
use crate::wire::Frame;

struct ChannelPair {
    message: Arc<RestoringMessageChannel>,
    data: Arc<RestoringDataChannel>,
}

/// One local endpoint's outbound channel pool, keyed by peer id.
pub struct SendingEndpoint {
    template: Arc<dyn ChannelTemplate>,
    pool: Mutex<HashMap<EndpointId, ChannelPair>>,
}

impl SendingEndpoint {
    pub fn new(template: Arc<dyn ChannelTemplate>) -> Self {
        Self {
            template,
            pool: Mutex::new(HashMap::new()),
        }
    }

    async fn pair_for(&self, peer: EndpointId, peer_info: &ProtocolInformation) -> ChannelPair {
        let mut guard = self.pool.lock().await;
        if let Some(pair) = guard.get(&peer) {
            return ChannelPair {
                message: pair.message.clone(),
                data: pair.data.clone(),
            };
        }
        let pair = ChannelPair {
            message: Arc::new(RestoringMessageChannel::new(
                self.template.clone(),
                peer,
                peer_info.message_address.clone(),
            )),
            data: Arc::new(RestoringDataChannel::new(
                self.template.clone(),
                peer,
                peer_info.data_address.clone(),
            )),
        };
        let cloned = ChannelPair {
            message: pair.message.clone(),
            data: pair.data.clone(),
        };
        guard.insert(peer, pair);
        cloned
    }

    /// Send one frame to `peer`, resolving or lazily creating its message
    /// channel first.
    pub async fn send(
        &self,
        peer: EndpointId,
        peer_info: &ProtocolInformation,
        frame: &Frame,
        max_retries: u32,
    ) -> Result<()> {
        let pair = self.pair_for(peer, peer_info).await;
        pair.message.send(frame, max_retries).await
    }

    /// Stream `body` to `peer`, resolving or lazily creating its data
    /// channel first.
    pub async fn send_stream<R: RewindableBody>(
        &self,
        peer: EndpointId,
        peer_info: &ProtocolInformation,
        header: DataTransferHeader,
        body: &mut R,
        max_retries: u32,
    ) -> Result<()> {
        let pair = self.pair_for(peer, peer_info).await;
        pair.data.send_stream(header, body, max_retries).await
    }

    /// Drop both channels to `peer`, if any. The caller holds the only
    /// remaining references once this returns, so the channels' transport
    /// handles are released as soon as any in-flight send completes.
    pub async fn close_channel_to(&self, peer: EndpointId) {
        self.pool.lock().await.remove(&peer);
    }

    /// Whether a channel pair currently exists for `peer` (used by tests
    /// and diagnostics; does not reflect whether the underlying transport
    /// connection is open).
    pub async fn has_channel_to(&self, peer: EndpointId) -> bool {
        self.pool.lock().await.contains_key(&peer)
    }
}
