//! # Data Handler
//!
//! Parallel counterpart to the Message Handler for bulk streams (spec
//! §4.5). `forward_data` registers a one-shot waiter keyed by the sending
//! peer's id; `process_data` drains an `IncomingStream` to disk, creating
//! missing parent directories as needed, and completes that waiter with
//! the written file's path, or with failure on any write error. Only one
//! inbound stream per peer is tracked at a time — a second arrival before
//! the first completes is dropped silently, since the sender is
//! responsible for retrying on its own send failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::completion::{completion, Completer, Completion};
use crate::identity::EndpointId;
use crate::transport::IncomingStream;

struct Waiter {
    target_path: PathBuf,
    completer: Completer<PathBuf>,
}

struct Inner {
    waiters: HashMap<EndpointId, Waiter>,
}

/// Routes inbound bulk streams to whichever caller is waiting for data
/// from a given peer.
pub struct DataHandler {
    inner: Mutex<Inner>,
}

impl DataHandler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiters: HashMap::new(),
            }),
        }
    }

    /// Register interest in the next inbound stream from `from`, to be
    /// written at `target_path`. Resolves with the path on success, or
    /// `Outcome::TimedOut` / `Outcome::Cancelled` otherwise.
    pub async fn forward_data(
        &self,
        from: EndpointId,
        target_path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Completion<PathBuf> {
        let (completer, completion) = completion::<PathBuf>();
        {
            let mut guard = self.inner.lock().await;
            guard.waiters.insert(
                from,
                Waiter {
                    target_path: target_path.into(),
                    completer: completer.clone(),
                },
            );
        }

        let cleanup = completer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cleanup.expire();
        });

        completion
    }

    /// Drain an inbound stream to whichever waiter was registered for its
    /// sender, if any. Silently drops the stream (acking negatively) when
    /// no waiter is registered, matching "a second frame arriving before
    /// the first waiter completes drops silently".
    pub async fn process_data(&self, incoming: IncomingStream) {
        let sender = incoming.header.sender;
        let waiter = {
            let mut guard = self.inner.lock().await;
            guard.waiters.remove(&sender)
        };

        let Some(waiter) = waiter else {
            debug!("no waiter registered for data from {sender}, dropping stream");
            let _ = incoming.acker.ack(false).await;
            return;
        };

        match write_to_disk(&waiter.target_path, incoming.body).await {
            Ok(()) => {
                let _ = incoming.acker.ack(true).await;
                waiter.completer.fulfill(waiter.target_path);
            }
            Err(e) => {
                warn!("failed writing inbound stream from {sender}: {e}");
                let _ = incoming.acker.ack(false).await;
                waiter.completer.cancel();
            }
        }
    }

    /// Cancel the waiter for `from`, if any (e.g. on peer sign-off).
    pub async fn on_endpoint_signed_off(&self, from: EndpointId) {
        let mut guard = self.inner.lock().await;
        if let Some(waiter) = guard.waiters.remove(&from) {
            waiter.completer.cancel();
        }
    }

    pub async fn on_local_channel_closed(&self) {
        let mut guard = self.inner.lock().await;
        for (_, waiter) in guard.waiters.drain() {
            waiter.completer.cancel();
        }
    }
}

impl Default for DataHandler {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_to_disk(
    target_path: &Path,
    mut body: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
) -> std::io::Result<()> {
    if let Some(parent) = target_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let mut file = fs::File::create(target_path).await?;
    tokio::io::copy(&mut body, &mut file).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Outcome;
    use crate::identity::MessageId;
    use crate::transport::DataTransferHeader;
    use crate::transport::test_support::RecordingAcker;

    #[tokio::test]
    async fn process_data_writes_file_and_fulfills_waiter() {
        let handler = DataHandler::new();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("payload.bin");
        let sender = EndpointId::generate();

        let completion = handler
            .forward_data(sender, target.clone(), Duration::from_secs(5))
            .await;

        let payload = b"hello bulk data".to_vec();
        let (acker, result) = RecordingAcker::new();
        let incoming = IncomingStream {
            header: DataTransferHeader {
                sender,
                id: MessageId::generate(),
                length: payload.len() as u64,
            },
            body: Box::new(std::io::Cursor::new(payload.clone())),
            acker: Box::new(acker),
        };
        handler.process_data(incoming).await;

        match completion.wait().await {
            Outcome::Value(path) => assert_eq!(path, target),
            other => panic!("expected Value, got {other:?}"),
        }
        assert_eq!(*result.lock().unwrap(), Some(true));
        let written = tokio::fs::read(&target).await.unwrap();
        assert_eq!(written, payload);
    }

    #[tokio::test]
    async fn second_arrival_without_waiter_is_dropped() {
        let handler = DataHandler::new();
        let sender = EndpointId::generate();
        let (acker, result) = RecordingAcker::new();
        let incoming = IncomingStream {
            header: DataTransferHeader {
                sender,
                id: MessageId::generate(),
                length: 4,
            },
            body: Box::new(std::io::Cursor::new(vec![1u8, 2, 3, 4])),
            acker: Box::new(acker),
        };
        handler.process_data(incoming).await;
        assert_eq!(*result.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn sign_off_cancels_pending_waiter() {
        let handler = DataHandler::new();
        let sender = EndpointId::generate();
        let completion = handler
            .forward_data(sender, "/tmp/unused.bin", Duration::from_secs(5))
            .await;
        handler.on_endpoint_signed_off(sender).await;
        match completion.wait().await {
            Outcome::Cancelled => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
