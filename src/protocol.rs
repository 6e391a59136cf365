//! # Protocol Layer
//!
//! The public façade composing every other module (spec §4.9). Callers
//! reach the rest of the crate only through here: `send_to` for
//! fire-and-forget frames, `send_and_wait` for request/response,
//! `transfer_data` for pulling a file from a peer, `verify_connection` for
//! an ad hoc keep-alive probe outside the Connection Monitor's own cycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::completion::Outcome;
use crate::config::ProtocolConfig;
use crate::data_handler::DataHandler;
use crate::error::{ProtocolError, Result};
use crate::handshake::{ApprovalPolicy, HandshakeConductor};
use crate::identity::{EndpointId, MessageId, ProtocolVersion};
use crate::message_handler::{FilterAction, FilterPredicate, MessageHandler};
use crate::model::{DiscoveryInformation, ProtocolDescription, ProtocolInformation};
use crate::monitor::ConnectionMonitor;
use crate::protocol_channel::ProtocolChannel;
use crate::registry::Registry;
use crate::sending::SendingEndpoint;
use crate::transport::{ChannelTemplate, DataTransferHeader};
use crate::wire::{Frame, FrameBody};

/// Resolves an inbound `DataDownloadRequest`'s `target_hint` to a local file
/// to stream back, or declines it. The crate has no opinion on what a
/// "target hint" means to the application; that mapping is the caller's.
#[async_trait]
pub trait DataRequestResolver: Send + Sync {
    async fn resolve(&self, peer: EndpointId, target_hint: &str) -> Option<PathBuf>;
}

/// One local peer's complete protocol-plane instance.
pub struct Protocol {
    local_id: EndpointId,
    registry: Arc<Registry>,
    message_handler: Arc<MessageHandler>,
    data_handler: Arc<DataHandler>,
    handshake: Arc<HandshakeConductor>,
    monitor: Arc<ConnectionMonitor>,
    channel: Arc<ProtocolChannel>,
    config: ProtocolConfig,
    background: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Protocol {
    pub fn new(
        local_id: EndpointId,
        local_discovery: DiscoveryInformation,
        local_description: ProtocolDescription,
        local_protocol_by_version: HashMap<ProtocolVersion, ProtocolInformation>,
        template: Arc<dyn ChannelTemplate>,
        policy: Arc<dyn ApprovalPolicy>,
        config: ProtocolConfig,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let sending = Arc::new(SendingEndpoint::new(template.clone()));
        let message_handler = Arc::new(MessageHandler::new(registry.clone()));
        let data_handler = Arc::new(DataHandler::new());
        let handshake = Arc::new(HandshakeConductor::new(
            local_id,
            local_discovery,
            local_description,
            local_protocol_by_version,
            registry.clone(),
            sending.clone(),
            policy,
            config.wait_for_response_timeout,
        ));
        let monitor = Arc::new(ConnectionMonitor::new(
            local_id,
            registry.clone(),
            sending.clone(),
            message_handler.clone(),
            &config,
        ));
        let channel = Arc::new(ProtocolChannel::new(
            local_id,
            template,
            registry.clone(),
            message_handler.clone(),
            data_handler.clone(),
            handshake.clone(),
            sending.clone(),
        ));
        Self {
            local_id,
            registry,
            message_handler,
            data_handler,
            handshake,
            monitor,
            channel,
            config,
            background: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Bind the given versions and start the Connection Monitor's loops.
    ///
    /// Binding can assign addresses that weren't known when this `Protocol`
    /// was constructed (e.g. an OS-chosen port); once the channel is open,
    /// the real addresses are published to the Handshake Conductor so later
    /// handshakes advertise them instead of the discovery-address
    /// placeholder.
    pub async fn open(&self, supported: &[ProtocolVersion]) -> anyhow::Result<()> {
        self.channel.open(supported).await?;
        for (version, info) in self.channel.local_connection_points().await {
            self.handshake.publish_local_protocol_information(version, info).await;
        }
        self.monitor.install_responder().await?;
        let mut tasks = self.monitor.spawn();
        tasks.push(self.handshake.spawn_timeout_loop());
        self.background.lock().await.append(&mut tasks);
        Ok(())
    }

    /// Send a farewell to every known peer, cancel every outstanding waiter,
    /// and stop every background loop.
    pub async fn close(&self) {
        self.channel.close().await;
        self.message_handler.on_local_channel_closed().await;
        self.data_handler.on_local_channel_closed().await;
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
    }

    /// Begin a handshake with a peer discovered at `discovery`.
    pub async fn connect_to(&self, peer: EndpointId, discovery: DiscoveryInformation) {
        self.handshake.initiate(peer, discovery).await;
    }

    /// Fire-and-forget send; fails only if the peer is unknown or every
    /// retry is exhausted.
    pub async fn send_to(&self, peer: EndpointId, body: FrameBody, retries: u32) -> Result<()> {
        let info = self
            .registry
            .connection_for(peer)
            .await
            .ok_or(ProtocolError::EndpointNotContactable(peer))?;
        let frame = Frame::new(self.local_id, None, body);
        self.channel.send(peer, &info.protocol, &frame, retries).await
    }

    /// Reply to `incoming`, carrying its id in `in_response_to` so a peer
    /// waiting in `send_and_wait` resolves. For frames the crate itself
    /// doesn't correlate (anything but handshake/keep-alive traffic), this
    /// is the only way an application-level responder can close the loop.
    pub async fn reply_to(&self, incoming: &Frame, body: FrameBody, retries: u32) -> Result<()> {
        let peer = incoming.header.sender;
        let info = self
            .registry
            .connection_for(peer)
            .await
            .ok_or(ProtocolError::EndpointNotContactable(peer))?;
        let frame = incoming.reply(self.local_id, body);
        self.channel.send(peer, &info.protocol, &frame, retries).await
    }

    /// Send and wait for a correlated reply, or `Timeout`/`Cancelled` if
    /// none arrives (the latter e.g. on the peer's sign-off mid-wait).
    pub async fn send_and_wait(
        &self,
        peer: EndpointId,
        body: FrameBody,
        retries: u32,
        timeout: Duration,
    ) -> Result<Frame> {
        let info = self
            .registry
            .connection_for(peer)
            .await
            .ok_or(ProtocolError::EndpointNotContactable(peer))?;
        let frame = Frame::new(self.local_id, None, body);
        let completion = self
            .message_handler
            .forward_response(peer, frame.header.id, timeout)
            .await;
        self.channel.send(peer, &info.protocol, &frame, retries).await?;
        match completion.wait().await {
            Outcome::Value(reply) => Ok(reply),
            Outcome::TimedOut => Err(ProtocolError::Timeout),
            Outcome::Cancelled => Err(ProtocolError::Cancelled),
        }
    }

    /// Request `target_hint` from `peer` and write the result to
    /// `target_path`. `cancel`, if given, lets the caller abandon the wait
    /// early (e.g. a user-initiated cancel); the stream itself is not
    /// interrupted, only the local wait — an already-accepted transfer
    /// still lands on disk.
    pub async fn transfer_data(
        &self,
        peer: EndpointId,
        target_hint: impl Into<String>,
        target_path: impl Into<PathBuf>,
        cancel: Option<oneshot::Receiver<()>>,
        retries: u32,
        timeout: Duration,
    ) -> Result<PathBuf> {
        let info = self
            .registry
            .connection_for(peer)
            .await
            .ok_or(ProtocolError::EndpointNotContactable(peer))?;
        let token = MessageId::generate();
        let completion = self
            .data_handler
            .forward_data(peer, target_path, timeout)
            .await;
        let request = Frame::new(
            self.local_id,
            None,
            FrameBody::DataDownloadRequest {
                token,
                target_hint: target_hint.into(),
            },
        );
        self.channel.send(peer, &info.protocol, &request, retries).await?;

        let outcome = match cancel {
            Some(cancel_rx) => tokio::select! {
                outcome = completion.wait() => outcome,
                _ = cancel_rx => Outcome::Cancelled,
            },
            None => completion.wait().await,
        };
        match outcome {
            Outcome::Value(path) => Ok(path),
            Outcome::TimedOut => Err(ProtocolError::Timeout),
            Outcome::Cancelled => Err(ProtocolError::Cancelled),
        }
    }

    /// Stream a local file back to `peer` as the data reply to `token`,
    /// typically called from a `DataRequestResolver` action.
    pub async fn fulfil_data_request(
        &self,
        peer: EndpointId,
        token: MessageId,
        path: &Path,
        retries: u32,
    ) -> Result<()> {
        let info = self
            .registry
            .connection_for(peer)
            .await
            .ok_or(ProtocolError::EndpointNotContactable(peer))?;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ProtocolError::SendFailed {
                peer,
                attempts: 0,
                source: e.into(),
            })?;
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ProtocolError::SendFailed {
                peer,
                attempts: 0,
                source: e.into(),
            })?;
        let header = DataTransferHeader {
            sender: self.local_id,
            id: token,
            length: metadata.len(),
        };
        self.channel
            .transfer_data(peer, &info.protocol, header, &mut file, retries)
            .await
    }

    /// Install the handler that answers inbound `DataDownloadRequest`
    /// frames by consulting `resolver`.
    pub async fn respond_to_data_requests(
        self: &Arc<Self>,
        resolver: Arc<dyn DataRequestResolver>,
    ) -> Result<()> {
        let protocol = self.clone();
        self.message_handler
            .act_on_arrival(
                "data-download-request-responder",
                Arc::new(|frame: &Frame| {
                    matches!(frame.body, FrameBody::DataDownloadRequest { .. })
                }),
                Arc::new(move |frame: Frame| {
                    let protocol = protocol.clone();
                    let resolver = resolver.clone();
                    Box::pin(async move {
                        let FrameBody::DataDownloadRequest { token, target_hint } = frame.body else {
                            return;
                        };
                        let peer = frame.header.sender;
                        match resolver.resolve(peer, &target_hint).await {
                            Some(path) => {
                                if let Err(e) = protocol.fulfil_data_request(peer, token, &path, 1).await {
                                    debug!("failed to fulfil data request from {peer}: {e}");
                                }
                            }
                            None => {
                                let _ = protocol
                                    .send_to(
                                        peer,
                                        FrameBody::Failure {
                                            reason: "no such download available".to_string(),
                                        },
                                        1,
                                    )
                                    .await;
                            }
                        }
                    })
                }),
                false,
            )
            .await
    }

    /// Install an application-level handler for inbound frames matching
    /// `predicate`, e.g. to answer a custom request type with `send_to`.
    /// Matches the registration primitive `respond_to_data_requests` itself
    /// uses; `last_chance` handlers run only when nothing else claimed the
    /// frame (spec §4.4 step 5).
    pub async fn on_arrival(
        &self,
        name: impl Into<String>,
        predicate: FilterPredicate,
        action: FilterAction,
        last_chance: bool,
    ) -> Result<()> {
        self.message_handler
            .act_on_arrival(name, predicate, action, last_chance)
            .await
    }

    /// An ad hoc keep-alive probe outside the Connection Monitor's own
    /// cycle, e.g. for an application that wants to confirm liveness before
    /// a large transfer.
    pub async fn verify_connection(
        &self,
        peer: EndpointId,
        timeout: Duration,
        payload: Option<Vec<u8>>,
    ) -> Result<Frame> {
        match self.monitor.verify(peer, payload, timeout).await {
            Outcome::Value(reply) => Ok(reply),
            Outcome::TimedOut => Err(ProtocolError::Timeout),
            Outcome::Cancelled => Err(ProtocolError::Cancelled),
        }
    }

    pub fn local_id(&self) -> EndpointId {
        self.local_id
    }

    pub async fn local_connection_points(&self) -> Vec<(ProtocolVersion, ProtocolInformation)> {
        self.channel.local_connection_points().await
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }
}
