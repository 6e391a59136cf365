//! # Restoring Channel
//!
//! Wraps one transport channel to one remote address. The key property is
//! that faults are survivable: whenever the current channel is absent or
//! no longer open, it is re-created under this wrapper's own lock before
//! the next attempt, rather than surfacing the fault directly to the
//! caller (spec §4.3).
//!
//! A send succeeds only once the transport reported no error, the remote
//! acknowledged receipt (for data sends — `DataSender::send_stream`
//! already folds that into its `Result`), and the channel is still open
//! after the call. Exhausting the retry budget surfaces `SendFailed`.
//! Retry-count semantics are **total attempts**, not "1 + retries" (the
//! design resolves spec §9's open question this way).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeekExt, ReadBuf};
use tokio::sync::Mutex;

use crate::error::{ProtocolError, Result};
use crate::identity::EndpointId;
use crate::transport::{Address, ChannelTemplate, DataSender, DataTransferHeader, MessageSender};
use crate::wire::Frame;

/// A send source that may support rewinding to its starting position. Only
/// sources that report `true` from `try_rewind` are retried past a
/// mid-stream fault; everything else surfaces `SendFailed` on first fault
/// (spec §8 "non-seekable stream + mid-send fault -> SendFailed without
/// further retry").
#[async_trait]
pub trait RewindableBody: AsyncRead + Unpin + Send {
    async fn try_rewind(&mut self) -> bool;
}

#[async_trait]
impl RewindableBody for tokio::fs::File {
    async fn try_rewind(&mut self) -> bool {
        self.rewind().await.is_ok()
    }
}

/// Wraps any `AsyncRead` that has no rewind mechanism (a network pipe, a
/// one-shot generator, …). `try_rewind` always reports failure.
pub struct NonSeekable<R>(pub R);

#[async_trait]
impl<R: AsyncRead + Unpin + Send> RewindableBody for NonSeekable<R> {
    async fn try_rewind(&mut self) -> bool {
        false
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for NonSeekable<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

/// Re-opens its underlying `MessageSender` on fault, under its own
/// creation lock, before every send attempt that needs one.
pub struct RestoringMessageChannel {
    template: Arc<dyn ChannelTemplate>,
    peer: EndpointId,
    addr: Address,
    current: Mutex<Option<Box<dyn MessageSender>>>,
}

impl RestoringMessageChannel {
    pub fn new(template: Arc<dyn ChannelTemplate>, peer: EndpointId, addr: Address) -> Self {
        Self {
            template,
            peer,
            addr,
            current: Mutex::new(None),
        }
    }

    async fn ensure_open(&self) -> anyhow::Result<()> {
        let mut guard = self.current.lock().await;
        let needs_new = match guard.as_ref() {
            Some(sender) => !sender.is_open(),
            None => true,
        };
        if needs_new {
            let sender = self.template.open_message_sender(&self.addr).await?;
            *guard = Some(sender);
        }
        Ok(())
    }

    /// Attempt the send up to `retries` times total. `retries = 0` never
    /// touches the transport and always fails.
    pub async fn send(&self, frame: &Frame, retries: u32) -> Result<()> {
        let mut last_err: Option<anyhow::Error> = None;
        for _attempt in 0..retries {
            if let Err(e) = self.ensure_open().await {
                last_err = Some(e);
                continue;
            }
            let mut guard = self.current.lock().await;
            let sender = guard.as_mut().expect("ensure_open populated the slot");
            match sender.send_frame(frame).await {
                Ok(()) if sender.is_open() => return Ok(()),
                Ok(()) => {
                    last_err = Some(anyhow::anyhow!("channel closed immediately after send"));
                }
                Err(e) => last_err = Some(e.into()),
            }
        }
        Err(ProtocolError::SendFailed {
            peer: self.peer,
            attempts: retries,
            source: last_err.unwrap_or_else(|| anyhow::anyhow!("retries exhausted with 0 attempts")),
        })
    }

    pub async fn is_open(&self) -> bool {
        match self.current.lock().await.as_ref() {
            Some(sender) => sender.is_open(),
            None => false,
        }
    }
}

/// Re-opens its underlying `DataSender` on fault, with stream-position
/// rewind between retries when the source supports it.
pub struct RestoringDataChannel {
    template: Arc<dyn ChannelTemplate>,
    peer: EndpointId,
    addr: Address,
    current: Mutex<Option<Box<dyn DataSender>>>,
}

impl RestoringDataChannel {
    pub fn new(template: Arc<dyn ChannelTemplate>, peer: EndpointId, addr: Address) -> Self {
        Self {
            template,
            peer,
            addr,
            current: Mutex::new(None),
        }
    }

    async fn ensure_open(&self) -> anyhow::Result<()> {
        let mut guard = self.current.lock().await;
        let needs_new = match guard.as_ref() {
            Some(sender) => !sender.is_open(),
            None => true,
        };
        if needs_new {
            let sender = self.template.open_data_sender(&self.addr).await?;
            *guard = Some(sender);
        }
        Ok(())
    }

    pub async fn send_stream<R: RewindableBody>(
        &self,
        header: DataTransferHeader,
        body: &mut R,
        retries: u32,
    ) -> Result<()> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..retries {
            if attempt > 0 && !body.try_rewind().await {
                break;
            }
            if let Err(e) = self.ensure_open().await {
                last_err = Some(e);
                continue;
            }
            let mut guard = self.current.lock().await;
            let sender = guard.as_mut().expect("ensure_open populated the slot");
            match sender.send_stream(header.clone(), body).await {
                Ok(()) if sender.is_open() => return Ok(()),
                Ok(()) => {
                    last_err = Some(anyhow::anyhow!("channel closed immediately after send"));
                }
                Err(e) => last_err = Some(e.into()),
            }
        }
        Err(ProtocolError::SendFailed {
            peer: self.peer,
            attempts: retries,
            source: last_err.unwrap_or_else(|| anyhow::anyhow!("retries exhausted with 0 attempts")),
        })
    }

    pub async fn is_open(&self) -> bool {
        match self.current.lock().await.as_ref() {
            Some(sender) => sender.is_open(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{MessageId, ProtocolVersion};
    use crate::transport::test_support::{RecordingDataSender, RecordingMessageSender};
    use crate::transport::{ReceiverHost, TransportError};
    use crate::wire::FrameBody;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct CountingTemplate {
        message_opens: AtomicU32,
        fail_first_n_opens: u32,
    }

    // A minimal template whose `open_message_sender` hands out fresh
    // `RecordingMessageSender`s, failing the first `fail_first_n_opens`
    // calls, to exercise the re-open path.
    #[async_trait]
    impl ChannelTemplate for CountingTemplate {
        async fn bind(
            &self,
            _version: ProtocolVersion,
        ) -> std::result::Result<ReceiverHost, TransportError> {
            let (_mtx, mrx) = mpsc::channel(1);
            let (_dtx, drx) = mpsc::channel(1);
            Ok(ReceiverHost {
                message_address: Address::Memory(0),
                data_address: Address::Memory(0),
                messages: mrx,
                data: drx,
            })
        }

        async fn open_message_sender(
            &self,
            _addr: &Address,
        ) -> std::result::Result<Box<dyn MessageSender>, TransportError> {
            let count = self.message_opens.fetch_add(1, Ordering::SeqCst);
            if count < self.fail_first_n_opens {
                return Err(TransportError::ConnectFailed(anyhow::anyhow!("refused")));
            }
            Ok(Box::new(RecordingMessageSender::new()))
        }

        async fn open_data_sender(
            &self,
            _addr: &Address,
        ) -> std::result::Result<Box<dyn DataSender>, TransportError> {
            unimplemented!("not exercised in these tests")
        }
    }

    #[tokio::test]
    async fn send_with_zero_retries_never_touches_transport() {
        let template = Arc::new(CountingTemplate {
            message_opens: AtomicU32::new(0),
            fail_first_n_opens: 0,
        });
        let channel = RestoringMessageChannel::new(template.clone(), EndpointId::generate(), Address::Memory(0));
        let frame = Frame::new(EndpointId::generate(), None, FrameBody::Success);

        let result = channel.send(&frame, 0).await;
        assert!(result.is_err());
        assert_eq!(template.message_opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_recovers_after_reopen() {
        let template = Arc::new(CountingTemplate {
            message_opens: AtomicU32::new(0),
            fail_first_n_opens: 1,
        });
        let channel = RestoringMessageChannel::new(template.clone(), EndpointId::generate(), Address::Memory(0));
        let frame = Frame::new(EndpointId::generate(), None, FrameBody::Success);

        let result = channel.send(&frame, 2).await;
        assert!(result.is_ok());
        assert_eq!(template.message_opens.load(Ordering::SeqCst), 2);
    }

    struct SingleDataTemplate {
        acknowledge: bool,
    }

    #[async_trait]
    impl ChannelTemplate for SingleDataTemplate {
        async fn bind(
            &self,
            _v: ProtocolVersion,
        ) -> std::result::Result<ReceiverHost, TransportError> {
            unimplemented!()
        }
        async fn open_message_sender(
            &self,
            _a: &Address,
        ) -> std::result::Result<Box<dyn MessageSender>, TransportError> {
            unimplemented!()
        }
        async fn open_data_sender(
            &self,
            _a: &Address,
        ) -> std::result::Result<Box<dyn DataSender>, TransportError> {
            Ok(Box::new(RecordingDataSender::new(self.acknowledge)))
        }
    }

    #[tokio::test]
    async fn unacknowledged_data_send_surfaces_as_send_failed() {
        let peer = EndpointId::generate();
        let template = Arc::new(SingleDataTemplate { acknowledge: false });
        let channel = RestoringDataChannel::new(template, peer, Address::Memory(0));
        let header = DataTransferHeader {
            sender: peer,
            id: MessageId::generate(),
            length: 4,
        };
        let mut body = NonSeekable(std::io::Cursor::new(vec![1u8, 2, 3, 4]));
        let result = channel.send_stream(header, &mut body, 1).await;
        assert!(matches!(result, Err(ProtocolError::SendFailed { .. })));
    }

    #[tokio::test]
    async fn non_seekable_fault_stops_after_first_attempt() {
        let peer = EndpointId::generate();
        let template = Arc::new(SingleDataTemplate { acknowledge: false });
        let channel = RestoringDataChannel::new(template.clone(), peer, Address::Memory(0));
        let header = DataTransferHeader {
            sender: peer,
            id: MessageId::generate(),
            length: 4,
        };
        // retries = 3, but the non-seekable body can't be rewound past
        // attempt 1, so only one open/send should actually happen.
        let mut body = NonSeekable(std::io::Cursor::new(vec![1u8, 2, 3, 4]));
        let result = channel.send_stream(header, &mut body, 3).await;
        assert!(matches!(result, Err(ProtocolError::SendFailed { .. })));
    }

    #[tokio::test]
    async fn seekable_stream_rewinds_and_retries_through_tempfile() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        {
            let mut f = tokio::fs::File::create(&path).await.unwrap();
            f.write_all(&[9u8; 32]).await.unwrap();
        }
        let mut file = tokio::fs::File::open(&path).await.unwrap();
        assert!(file.try_rewind().await);
    }
}
