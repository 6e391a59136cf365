//! # Single-Shot Completion Primitive
//!
//! Replaces the "observable + cancellation source + wrapping future"
//! triple the original reaches for with one primitive that supports
//! `fulfill`, `cancel` and `expire` (timeout), all of which race to
//! resolve the same future — whichever gets there first wins, and the
//! rest become no-ops (spec §9 "completion primitive", §8 "timeout fires
//! exactly once even if the response arrives during the timeout handler").

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// How a waiter's completion resolved.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The awaited value arrived.
    Value(T),
    /// The waiter's deadline elapsed first.
    TimedOut,
    /// The waiter was cancelled (peer sign-off, local shutdown, explicit).
    Cancelled,
}

/// The producing half: whichever of `fulfill`/`cancel`/`expire` runs first
/// resolves the paired `Completion`; later calls are no-ops.
#[derive(Clone)]
pub struct Completer<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<Outcome<T>>>>>,
}

/// The consuming half: a future that resolves at most once.
pub struct Completion<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
}

/// Create a linked `(Completer, Completion)` pair.
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completer {
            slot: Arc::new(Mutex::new(Some(tx))),
        },
        Completion { receiver: rx },
    )
}

impl<T> Completer<T> {
    /// Resolve with the awaited value. Returns `true` if this call won the race.
    pub fn fulfill(&self, value: T) -> bool {
        self.resolve(Outcome::Value(value))
    }

    /// Resolve as cancelled. Returns `true` if this call won the race.
    pub fn cancel(&self) -> bool {
        self.resolve(Outcome::Cancelled)
    }

    /// Resolve as timed out. Returns `true` if this call won the race.
    pub fn expire(&self) -> bool {
        self.resolve(Outcome::TimedOut)
    }

    /// Whether this completer has already resolved (by any path).
    pub fn is_resolved(&self) -> bool {
        self.slot.lock().expect("completer mutex poisoned").is_none()
    }

    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let mut guard = self.slot.lock().expect("completer mutex poisoned");
        match guard.take() {
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }
}

impl<T> Completion<T> {
    /// Wait for the completer to resolve. A completer dropped without
    /// resolving (e.g. the owning component panicked) surfaces as
    /// `Cancelled`, matching "local channel closed cancels every waiter".
    pub async fn wait(self) -> Outcome<T> {
        self.receiver.await.unwrap_or(Outcome::Cancelled)
    }
}
