//! # Message Handler
//!
//! Dispatches incoming frames: response correlation against outstanding
//! waiters, a predicate-ordered filter set for unsolicited traffic, and a
//! single last-chance fallback slot for anything no filter claimed (spec
//! §4.4). `process_message` is the entry point the receive task calls for
//! every frame off the wire; it never holds the handler's lock while
//! invoking a waiter completion or a filter action, since either can
//! trigger a send that needs the lock back (spec §5 "no reader holds a
//! guard during callback dispatch").

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{trace, warn};

use crate::completion::{completion, Completer, Completion, Outcome};
use crate::error::{ProtocolError, Result};
use crate::identity::{EndpointId, MessageId};
use crate::registry::Registry;
use crate::wire::Frame;

pub type FilterAction = Arc<dyn Fn(Frame) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
pub type FilterPredicate = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

/// What `process_message` did with a frame. `Unhandled` is the "no filter,
/// no last-chance handler" case (spec §4.4 step 5 with nothing installed);
/// the caller is expected to answer it with `UnknownMessageType` (spec §8
/// scenario 6), since the handler itself has no way to send a reply.
#[derive(Debug)]
pub enum Disposition {
    Handled,
    Unhandled { sender: EndpointId, in_reply_to: MessageId },
}

struct Filter {
    name: String,
    predicate: FilterPredicate,
    action: FilterAction,
}

struct Waiter {
    expected_sender: EndpointId,
    completer: Completer<Frame>,
}

struct Inner {
    waiters: HashMap<MessageId, Waiter>,
    filters: Vec<Filter>,
    last_chance: Option<FilterAction>,
}

/// Dispatches incoming frames for one protocol-layer instance.
pub struct MessageHandler {
    registry: Arc<Registry>,
    inner: Mutex<Inner>,
    integrity: broadcast::Sender<EndpointId>,
}

impl MessageHandler {
    pub fn new(registry: Arc<Registry>) -> Self {
        let (integrity, _) = broadcast::channel(256);
        Self {
            registry,
            inner: Mutex::new(Inner {
                waiters: HashMap::new(),
                filters: Vec::new(),
                last_chance: None,
            }),
            integrity,
        }
    }

    /// Subscribed by the Connection Monitor to reset a peer's failure
    /// counter on any received traffic, not just successful probes.
    pub fn subscribe_integrity(&self) -> broadcast::Receiver<EndpointId> {
        self.integrity.subscribe()
    }

    /// Register a waiter for the reply to `in_response_to` expected from
    /// `expected_sender`. The returned `Completion` resolves with the
    /// matching frame, `Outcome::TimedOut` after `timeout`, or
    /// `Outcome::Cancelled` on peer sign-off / local shutdown.
    pub async fn forward_response(
        &self,
        expected_sender: EndpointId,
        in_response_to: MessageId,
        timeout: Duration,
    ) -> Completion<Frame> {
        let (completer, completion) = completion::<Frame>();
        {
            let mut guard = self.inner.lock().await;
            guard.waiters.insert(
                in_response_to,
                Waiter {
                    expected_sender,
                    completer: completer.clone(),
                },
            );
        }

        let inner_for_cleanup = completer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner_for_cleanup.expire();
        });

        completion
    }

    /// Install a filter. A non-last-chance filter is appended to the
    /// ordered set; a last-chance filter replaces the single fallback
    /// slot. Re-registering a `name` already present among the ordered
    /// filters is a `DuplicateRegistration`, as is re-installing a
    /// last-chance handler while one is already set.
    pub async fn act_on_arrival(
        &self,
        name: impl Into<String>,
        predicate: FilterPredicate,
        action: FilterAction,
        last_chance: bool,
    ) -> Result<()> {
        let name = name.into();
        let mut guard = self.inner.lock().await;
        if last_chance {
            if guard.last_chance.is_some() {
                return Err(ProtocolError::DuplicateRegistration);
            }
            guard.last_chance = Some(action);
            return Ok(());
        }
        if guard.filters.iter().any(|f| f.name == name) {
            return Err(ProtocolError::DuplicateRegistration);
        }
        guard.filters.push(Filter {
            name,
            predicate,
            action,
        });
        Ok(())
    }

    /// Entry point for every incoming frame. Safe to call concurrently
    /// from multiple receive tasks.
    pub async fn process_message(&self, frame: Frame) -> Disposition {
        let _ = self.integrity.send(frame.header.sender);

        if let Some(in_response_to) = frame.header.in_response_to {
            let waiter = {
                let mut guard = self.inner.lock().await;
                guard.waiters.remove(&in_response_to)
            };
            if let Some(waiter) = waiter {
                waiter.completer.fulfill(frame);
            } else {
                trace!("no waiter for response {in_response_to}, dropping frame");
            }
            return Disposition::Handled;
        }

        let admitted = self.registry.can_communicate_with(frame.header.sender).await
            || frame.body.is_handshake()
            || frame.body.is_disconnect();
        if !admitted {
            trace!(
                "dropping frame from unapproved sender {}",
                frame.header.sender
            );
            return Disposition::Handled;
        }

        let (matched_action, fallback) = {
            let guard = self.inner.lock().await;
            let matched = guard
                .filters
                .iter()
                .find(|f| (f.predicate)(&frame))
                .map(|f| f.action.clone());
            (matched, guard.last_chance.clone())
        };

        if let Some(action) = matched_action {
            action(frame).await;
            return Disposition::Handled;
        }
        if let Some(action) = fallback {
            action(frame).await;
            return Disposition::Handled;
        }
        warn!(
            "no filter or last-chance handler matched frame from {}, answering UnknownMessageType",
            frame.header.sender
        );
        Disposition::Unhandled {
            sender: frame.header.sender,
            in_reply_to: frame.header.id,
        }
    }

    /// Cancel every waiter expecting a reply from `id` (spec: a peer
    /// sign-off must not leave a waiter hanging forever).
    pub async fn on_endpoint_signed_off(&self, id: EndpointId) {
        let mut guard = self.inner.lock().await;
        let stale: Vec<MessageId> = guard
            .waiters
            .iter()
            .filter(|(_, w)| w.expected_sender == id)
            .map(|(mid, _)| *mid)
            .collect();
        for mid in stale {
            if let Some(waiter) = guard.waiters.remove(&mid) {
                waiter.completer.cancel();
            }
        }
    }

    /// Cancel every outstanding waiter, e.g. on local shutdown.
    pub async fn on_local_channel_closed(&self) {
        let mut guard = self.inner.lock().await;
        for (_, waiter) in guard.waiters.drain() {
            waiter.completer.cancel();
        }
    }
}
