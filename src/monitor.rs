//! # Connection Monitor
//!
//! Periodically probes every `Approved` peer with a `ConnectionVerification`
//! frame and evicts anyone who stops answering (spec §4.8). A peer's missed-
//! probe counter resets on *any* traffic from it, not just a probe reply —
//! the monitor subscribes to the Message Handler's integrity broadcast for
//! that, so an otherwise-busy peer is never evicted just because its reply
//! to one particular probe happened to race the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::identity::EndpointId;
use crate::message_handler::MessageHandler;
use crate::registry::Registry;
use crate::sending::SendingEndpoint;
use crate::wire::{Frame, FrameBody};

/// Tracks liveness of every `Approved` peer for one local endpoint.
pub struct ConnectionMonitor {
    local_id: EndpointId,
    registry: Arc<Registry>,
    sending: Arc<SendingEndpoint>,
    message_handler: Arc<MessageHandler>,
    interval: Duration,
    response_timeout: Duration,
    max_missed: u32,
    failures: Mutex<HashMap<EndpointId, u32>>,
}

impl ConnectionMonitor {
    pub fn new(
        local_id: EndpointId,
        registry: Arc<Registry>,
        sending: Arc<SendingEndpoint>,
        message_handler: Arc<MessageHandler>,
        config: &ProtocolConfig,
    ) -> Self {
        Self {
            local_id,
            registry,
            sending,
            message_handler,
            interval: config.keep_alive_interval,
            response_timeout: config.max_time_between_connection_confirmations,
            max_missed: config.max_missed_keep_alive_signals,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the tick loop and the integrity-reset listener. Both run until
    /// their returned handles are aborted (by the owning Protocol Channel
    /// on `close()`).
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let tick_monitor = self.clone();
        let tick_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_monitor.interval);
            loop {
                ticker.tick().await;
                tick_monitor.probe_all().await;
            }
        });

        let integrity_monitor = self.clone();
        let mut integrity = self.message_handler.subscribe_integrity();
        let integrity_task = tokio::spawn(async move {
            while let Ok(peer) = integrity.recv().await {
                integrity_monitor.reset(peer).await;
            }
        });

        vec![tick_task, integrity_task]
    }

    async fn reset(&self, peer: EndpointId) {
        self.failures.lock().await.insert(peer, 0);
    }

    async fn probe_all(&self) {
        for peer in self.registry.approved_ids().await {
            let healthy = self.probe_once(peer).await;
            let evict = {
                let mut guard = self.failures.lock().await;
                let count = guard.entry(peer).or_insert(0);
                if healthy {
                    *count = 0;
                    false
                } else {
                    *count += 1;
                    debug!("missed keep-alive {} of {} from {peer}", count, self.max_missed);
                    *count >= self.max_missed
                }
            };
            if evict {
                warn!("evicting {peer} after {} missed keep-alive signals", self.max_missed);
                self.failures.lock().await.remove(&peer);
                self.registry.try_remove(peer).await;
            }
        }
    }

    /// Probe one peer and wait up to `response_timeout` for its reply.
    async fn probe_once(&self, peer: EndpointId) -> bool {
        let Some(info) = self.registry.connection_for(peer).await else {
            return false;
        };
        let probe = Frame::new(
            self.local_id,
            None,
            FrameBody::ConnectionVerification { payload: None },
        );
        let waiter = self
            .message_handler
            .forward_response(peer, probe.header.id, self.response_timeout)
            .await;
        if self.sending.send(peer, &info.protocol, &probe, 1).await.is_err() {
            return false;
        }
        matches!(
            waiter.wait().await,
            crate::completion::Outcome::Value(_)
        )
    }

    /// Send one ad hoc verification probe and return the correlated
    /// response, for callers (the Protocol Layer's `verify_connection`)
    /// that want the reply payload rather than just a liveness bit.
    pub async fn verify(
        &self,
        peer: EndpointId,
        payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> crate::completion::Outcome<Frame> {
        let Some(info) = self.registry.connection_for(peer).await else {
            return crate::completion::Outcome::Cancelled;
        };
        let probe = Frame::new(self.local_id, None, FrameBody::ConnectionVerification { payload });
        let waiter = self
            .message_handler
            .forward_response(peer, probe.header.id, timeout)
            .await;
        if let Err(e) = self.sending.send(peer, &info.protocol, &probe, 1).await {
            debug!("verification probe to {peer} failed to send: {e}");
            return crate::completion::Outcome::Cancelled;
        }
        waiter.wait().await
    }

    /// Install the filter that answers an incoming `ConnectionVerification`
    /// with a `ConnectionVerificationResponse` echoing its payload back.
    pub async fn install_responder(self: &Arc<Self>) -> crate::error::Result<()> {
        let local_id = self.local_id;
        let sending = self.sending.clone();
        let registry = self.registry.clone();
        self.message_handler
            .act_on_arrival(
                "connection-verification-responder",
                Arc::new(|frame: &Frame| {
                    matches!(frame.body, FrameBody::ConnectionVerification { .. })
                }),
                Arc::new(move |frame: Frame| {
                    let sending = sending.clone();
                    let registry = registry.clone();
                    Box::pin(async move {
                        let FrameBody::ConnectionVerification { payload } = frame.body.clone() else {
                            return;
                        };
                        let peer = frame.header.sender;
                        let Some(info) = registry.connection_for(peer).await else {
                            return;
                        };
                        let response = frame.reply(
                            local_id,
                            FrameBody::ConnectionVerificationResponse { payload },
                        );
                        if let Err(e) = sending.send(peer, &info.protocol, &response, 1).await {
                            debug!("failed to answer keep-alive probe from {peer}: {e}");
                        }
                    })
                }),
                false,
            )
            .await
    }

    #[cfg(test)]
    async fn failure_count(&self, peer: EndpointId) -> u32 {
        *self.failures.lock().await.get(&peer).unwrap_or(&0)
    }
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}
