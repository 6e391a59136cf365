//! # In-Process Test Doubles
//!
//! Lightweight `MessageSender`/`DataSender`/`Acker` stand-ins that record
//! what they were sent instead of touching a socket, so registry,
//! handshake and message-handler tests can run without a real transport.
//! Mirrors the teacher's habit of keeping a `MockTransport` alongside the
//! real `TcpSocketTransport` for unit-level coverage.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::wire::Frame;

use super::{Acker, DataSender, DataTransferHeader, MessageSender, TransportError};

/// A `MessageSender` that appends every frame it's given to a shared log
/// instead of sending it anywhere. `fail_next` makes the next `n` sends
/// report a fault, for exercising retry logic.
pub struct RecordingMessageSender {
    pub sent: Arc<Mutex<Vec<Frame>>>,
    pub open: Arc<Mutex<bool>>,
    fail_next: Arc<Mutex<u32>>,
}

impl RecordingMessageSender {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(Mutex::new(true)),
            fail_next: Arc::new(Mutex::new(0)),
        }
    }

    pub fn fail_next_n(&self, n: u32) {
        *self.fail_next.lock().unwrap() = n;
    }
}

#[async_trait]
impl MessageSender for RecordingMessageSender {
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let mut remaining = self.fail_next.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            *self.open.lock().unwrap() = false;
            return Err(TransportError::Faulted(anyhow::anyhow!("test fault")));
        }
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }
}

/// A `DataSender` that drains the source stream into a shared buffer.
pub struct RecordingDataSender {
    pub received: Arc<Mutex<Vec<(DataTransferHeader, Vec<u8>)>>>,
    pub open: Arc<Mutex<bool>>,
    pub acknowledge: bool,
}

impl RecordingDataSender {
    pub fn new(acknowledge: bool) -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(Mutex::new(true)),
            acknowledge,
        }
    }
}

#[async_trait]
impl DataSender for RecordingDataSender {
    async fn send_stream(
        &mut self,
        header: DataTransferHeader,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), TransportError> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf)
            .await
            .map_err(|e| TransportError::Faulted(e.into()))?;
        if !self.acknowledge {
            *self.open.lock().unwrap() = false;
            return Err(TransportError::NotAcknowledged);
        }
        self.received.lock().unwrap().push((header, buf));
        Ok(())
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }
}

/// An `Acker` that records whether it was acknowledged positively.
pub struct RecordingAcker {
    pub result: Arc<Mutex<Option<bool>>>,
}

impl RecordingAcker {
    pub fn new() -> (Self, Arc<Mutex<Option<bool>>>) {
        let result = Arc::new(Mutex::new(None));
        (
            Self {
                result: result.clone(),
            },
            result,
        )
    }
}

#[async_trait]
impl Acker for RecordingAcker {
    async fn ack(self: Box<Self>, ok: bool) -> Result<(), TransportError> {
        *self.result.lock().unwrap() = Some(ok);
        Ok(())
    }
}
