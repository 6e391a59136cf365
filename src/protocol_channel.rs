//! # Protocol Channel
//!
//! Owns, for one transport template, the per-version receiver hosts and
//! sender pools, plus the locally chosen `ProtocolInformation` per version
//! (spec §4.7). `open()` stands up every supported version's receiver and
//! starts its dispatch loop; `close()` sends a best-effort
//! `EndpointDisconnect` to every known peer (retries=1, failures ignored —
//! the process is going away regardless), then tears down each host.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::channel::RewindableBody;
use crate::data_handler::DataHandler;
use crate::handshake::HandshakeConductor;
use crate::identity::{EndpointId, ProtocolVersion};
use crate::message_handler::{Disposition, MessageHandler};
use crate::model::ProtocolInformation;
use crate::registry::Registry;
use crate::sending::SendingEndpoint;
use crate::transport::{ChannelTemplate, DataTransferHeader};
use crate::wire::{Frame, FrameBody};

struct VersionHandle {
    local: ProtocolInformation,
    dispatch_tasks: Vec<JoinHandle<()>>,
}

/// Coordinates receive dispatch and outbound sends for every protocol
/// version this instance supports, over one transport template.
pub struct ProtocolChannel {
    local_id: EndpointId,
    template: Arc<dyn ChannelTemplate>,
    registry: Arc<Registry>,
    message_handler: Arc<MessageHandler>,
    data_handler: Arc<DataHandler>,
    handshake: Arc<HandshakeConductor>,
    sending: Arc<SendingEndpoint>,
    versions: tokio::sync::Mutex<HashMap<ProtocolVersion, VersionHandle>>,
}

impl ProtocolChannel {
    pub fn new(
        local_id: EndpointId,
        template: Arc<dyn ChannelTemplate>,
        registry: Arc<Registry>,
        message_handler: Arc<MessageHandler>,
        data_handler: Arc<DataHandler>,
        handshake: Arc<HandshakeConductor>,
        sending: Arc<SendingEndpoint>,
    ) -> Self {
        Self {
            local_id,
            template,
            registry,
            message_handler,
            data_handler,
            handshake,
            sending,
            versions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Bind every version in `supported` and start its dispatch loop.
    pub async fn open(&self, supported: &[ProtocolVersion]) -> anyhow::Result<()> {
        for &version in supported {
            let host = self.template.bind(version).await?;
            let local = ProtocolInformation {
                version,
                message_address: host.message_address,
                data_address: host.data_address,
            };

            let handshake = self.handshake.clone();
            let message_handler = self.message_handler.clone();
            let registry = self.registry.clone();
            let data_handler_for_signoff = self.data_handler.clone();
            let sending = self.sending.clone();
            let local_id = self.local_id;
            let mut messages = host.messages;
            let message_task = tokio::spawn(async move {
                while let Some(frame) = messages.recv().await {
                    if handshake.on_frame(&frame).await {
                        continue;
                    }
                    if frame.body.is_disconnect() {
                        let peer = frame.header.sender;
                        registry.try_remove(peer).await;
                        message_handler.on_endpoint_signed_off(peer).await;
                        data_handler_for_signoff.on_endpoint_signed_off(peer).await;
                        continue;
                    }
                    if let Disposition::Unhandled { sender, in_reply_to } =
                        message_handler.process_message(frame).await
                    {
                        if let Some(info) = registry.connection_for(sender).await {
                            let reply = Frame::new(local_id, Some(in_reply_to), FrameBody::UnknownMessageType);
                            if let Err(e) = sending.send(sender, &info.protocol, &reply, 1).await {
                                debug!("failed to answer unknown frame from {sender}: {e}");
                            }
                        }
                    }
                }
            });

            let data_handler = self.data_handler.clone();
            let mut data = host.data;
            let data_task = tokio::spawn(async move {
                while let Some(incoming) = data.recv().await {
                    data_handler.process_data(incoming).await;
                }
            });

            self.versions.lock().await.insert(
                version,
                VersionHandle {
                    local,
                    dispatch_tasks: vec![message_task, data_task],
                },
            );
        }
        Ok(())
    }

    /// Best-effort farewell to every known peer, then tear down every
    /// dispatch loop and clear local connection points.
    pub async fn close(&self) {
        let peers = self.registry.approved_ids().await;
        for peer in peers {
            if let Some(info) = self.registry.connection_for(peer).await {
                let frame = Frame::new(self.local_id, None, FrameBody::EndpointDisconnect);
                if let Err(e) = self.sending.send(peer, &info.protocol, &frame, 1).await {
                    debug!("best-effort disconnect to {peer} failed, proceeding anyway: {e}");
                }
            }
        }

        let mut guard = self.versions.lock().await;
        for (version, handle) in guard.drain() {
            for task in handle.dispatch_tasks {
                task.abort();
            }
            debug!("protocol channel for {version} torn down");
        }
    }

    /// The `(version, ProtocolInformation)` pairs this channel currently
    /// publishes.
    pub async fn local_connection_points(&self) -> Vec<(ProtocolVersion, ProtocolInformation)> {
        self.versions
            .lock()
            .await
            .iter()
            .map(|(v, handle)| (*v, handle.local.clone()))
            .collect()
    }

    pub async fn local_connection_point_for(
        &self,
        version: ProtocolVersion,
    ) -> Option<ProtocolInformation> {
        self.versions
            .lock()
            .await
            .get(&version)
            .map(|handle| handle.local.clone())
    }

    /// Send a frame to `peer_info`, picking the sender pool for its
    /// negotiated version (there is exactly one `SendingEndpoint` per
    /// channel, shared across versions, since the pool itself keys on
    /// `ProtocolInformation`).
    pub async fn send(
        &self,
        peer: EndpointId,
        peer_info: &ProtocolInformation,
        message: &Frame,
        retries: u32,
    ) -> crate::error::Result<()> {
        self.sending.send(peer, peer_info, message, retries).await
    }

    /// Stream a local body to `peer_info`, picking the sender pool for its
    /// negotiated version. Used to fulfil an inbound `DataDownloadRequest`;
    /// the request's `token` becomes the stream's `DataTransferHeader.id` so
    /// the peer's own `Data Handler` can correlate it.
    pub async fn transfer_data<R: RewindableBody>(
        &self,
        peer: EndpointId,
        peer_info: &ProtocolInformation,
        header: DataTransferHeader,
        body: &mut R,
        retries: u32,
    ) -> crate::error::Result<()> {
        self.sending
            .send_stream(peer, peer_info, header, body, retries)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::IntersectingPolicy;
    use crate::model::{DiscoveryInformation, ProtocolDescription};
    use crate::transport::test_support::RecordingMessageSender;
    use crate::transport::{Address, DataSender, MessageSender, ReceiverHost, TransportError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct MemoryTemplate;

    #[async_trait]
    impl ChannelTemplate for MemoryTemplate {
        async fn bind(
            &self,
            version: ProtocolVersion,
        ) -> std::result::Result<ReceiverHost, TransportError> {
            let (_mtx, mrx) = mpsc::channel(4);
            let (_dtx, drx) = mpsc::channel(4);
            Ok(ReceiverHost {
                message_address: Address::Memory(version.major as u64),
                data_address: Address::Memory(100 + version.major as u64),
                messages: mrx,
                data: drx,
            })
        }

        async fn open_message_sender(
            &self,
            _addr: &Address,
        ) -> std::result::Result<Box<dyn MessageSender>, TransportError> {
            Ok(Box::new(RecordingMessageSender::new()))
        }

        async fn open_data_sender(
            &self,
            _addr: &Address,
        ) -> std::result::Result<Box<dyn DataSender>, TransportError> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn build_channel(local_id: EndpointId) -> ProtocolChannel {
        let registry = Arc::new(Registry::new());
        let template: Arc<dyn ChannelTemplate> = Arc::new(MemoryTemplate);
        let sending = Arc::new(SendingEndpoint::new(template.clone()));
        let message_handler = Arc::new(MessageHandler::new(registry.clone()));
        let data_handler = Arc::new(DataHandler::new());
        let handshake = Arc::new(HandshakeConductor::new(
            local_id,
            DiscoveryInformation {
                discovery_address: Address::Memory(0),
            },
            ProtocolDescription::new(["chat".to_string()]),
            HashMap::new(),
            registry.clone(),
            sending.clone(),
            Arc::new(IntersectingPolicy {
                local: ProtocolDescription::new(["chat".to_string()]),
            }),
            Duration::from_secs(1),
        ));
        ProtocolChannel::new(
            local_id,
            template,
            registry,
            message_handler,
            data_handler,
            handshake,
            sending,
        )
    }

    #[tokio::test]
    async fn open_publishes_one_connection_point_per_version() {
        let channel = build_channel(EndpointId::generate());
        let versions = [ProtocolVersion::new(1, 0), ProtocolVersion::new(2, 0)];
        channel.open(&versions).await.unwrap();

        let points = channel.local_connection_points().await;
        assert_eq!(points.len(), 2);
        assert!(channel
            .local_connection_point_for(ProtocolVersion::new(1, 0))
            .await
            .is_some());

        channel.close().await;
        assert!(channel.local_connection_points().await.is_empty());
    }

    #[tokio::test]
    async fn close_reaches_every_approved_peer_and_clears_connection_points() {
        let channel = build_channel(EndpointId::generate());
        channel.open(&[ProtocolVersion::new(1, 0)]).await.unwrap();

        let peer = EndpointId::generate();
        let info = EndpointInformationForTest::sample(peer);
        channel.registry.try_add(info.clone()).await;
        channel
            .registry
            .try_start_approval(peer, ProtocolDescription::new(["chat".to_string()]))
            .await;
        channel.registry.try_complete_approval(peer).await;

        // close() is best-effort: it does not touch the registry, only the
        // dispatch loops and published connection points.
        channel.close().await;
        assert!(channel.registry.can_communicate_with(peer).await);
        assert!(channel.local_connection_points().await.is_empty());
    }

    struct EndpointInformationForTest;

    impl EndpointInformationForTest {
        fn sample(id: EndpointId) -> crate::model::EndpointInformation {
            crate::model::EndpointInformation {
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
    }
}
