//! # TCP Reference Transport
//!
//! A concrete `ChannelTemplate` over TCP, grounded on the teacher's
//! `ipc::tcp_socket::TcpSocketTransport`: length-prefixed (4-byte
//! little-endian) frames, `socket2` nodelay tuning on every accepted or
//! dialed connection, and one background accept loop per listener that
//! fans incoming frames/streams into an `mpsc` channel the receiver host
//! exposes.
//!
//! The data channel additionally writes a 1-byte acknowledgement back to
//! the sender after the Data Handler has finished writing a stream to
//! disk, so `DataSender::send_stream` only reports success once the
//! remote has actually persisted the bytes (spec §4.3 send-success
//! criteria).

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::identity::ProtocolVersion;
use crate::wire::Frame;

use super::{
    Acker, Address, ChannelTemplate, DataSender, DataTransferHeader, IncomingStream,
    MessageSender, ReceiverHost, TransportError,
};

const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// One TCP-backed transport template. Binds fresh message/data listeners
/// per protocol version on `host`, using `port` (or an OS-assigned port
/// when `port == 0`) as the starting point for the message listener.
pub struct TcpChannelTemplate {
    host: String,
    port: u16,
}

impl TcpChannelTemplate {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn to_socket_addr(addr: &Address) -> Result<std::net::SocketAddr, TransportError> {
        match addr {
            Address::Tcp(socket_addr) => Ok(*socket_addr),
            other => Err(TransportError::ConnectFailed(anyhow::anyhow!(
                "not a TCP address: {other}"
            ))),
        }
    }

    fn tune(stream: &TcpStream) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        Ok(())
    }
}

async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<Frame> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("frame too large: {len} bytes");
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Frame::from_bytes(&buf)
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> anyhow::Result<()> {
    let bytes = frame.to_bytes()?;
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

struct TcpMessageSender {
    stream: TcpStream,
    open: bool,
}

#[async_trait]
impl MessageSender for TcpMessageSender {
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        match write_frame(&mut self.stream, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.open = false;
                Err(TransportError::Faulted(e))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct TcpDataSender {
    stream: TcpStream,
    open: bool,
}

#[async_trait]
impl DataSender for TcpDataSender {
    async fn send_stream(
        &mut self,
        header: DataTransferHeader,
        body: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<(), TransportError> {
        let result: anyhow::Result<bool> = async {
            let header_bytes = bincode::serialize(&header)?;
            self.stream
                .write_all(&(header_bytes.len() as u32).to_le_bytes())
                .await?;
            self.stream.write_all(&header_bytes).await?;

            let mut limited = body.take(header.length);
            let copied = tokio::io::copy(&mut limited, &mut self.stream).await?;
            if copied != header.length {
                anyhow::bail!(
                    "short read from source stream: expected {} bytes, got {copied}",
                    header.length
                );
            }
            self.stream.flush().await?;

            let mut ack = [0u8; 1];
            self.stream.read_exact(&mut ack).await?;
            Ok(ack[0] == 1)
        }
        .await;

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.open = false;
                Err(TransportError::NotAcknowledged)
            }
            Err(e) => {
                self.open = false;
                Err(TransportError::Faulted(e))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct TcpAcker {
    write_half: OwnedWriteHalf,
}

#[async_trait]
impl Acker for TcpAcker {
    async fn ack(mut self: Box<Self>, ok: bool) -> Result<(), TransportError> {
        self.write_half
            .write_all(&[if ok { 1 } else { 0 }])
            .await
            .map_err(|e| TransportError::Faulted(e.into()))?;
        self.write_half
            .flush()
            .await
            .map_err(|e| TransportError::Faulted(e.into()))
    }
}

#[async_trait]
impl ChannelTemplate for TcpChannelTemplate {
    async fn bind(&self, version: ProtocolVersion) -> Result<ReceiverHost, TransportError> {
        let bind_addr = format!("{}:{}", self.host, self.port);
        let message_listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.into()))?;
        let data_listener = TcpListener::bind(format!("{}:0", self.host))
            .await
            .map_err(|e| TransportError::ConnectFailed(e.into()))?;

        let message_address = Address::Tcp(
            message_listener
                .local_addr()
                .map_err(|e| TransportError::ConnectFailed(e.into()))?,
        );
        let data_address = Address::Tcp(
            data_listener
                .local_addr()
                .map_err(|e| TransportError::ConnectFailed(e.into()))?,
        );

        let (message_tx, message_rx) = mpsc::channel(256);
        tokio::spawn(accept_messages(message_listener, message_tx, version));

        let (data_tx, data_rx) = mpsc::channel(64);
        tokio::spawn(accept_data(data_listener, data_tx, version));

        Ok(ReceiverHost {
            message_address,
            data_address,
            messages: message_rx,
            data: data_rx,
        })
    }

    async fn open_message_sender(
        &self,
        addr: &Address,
    ) -> Result<Box<dyn MessageSender>, TransportError> {
        let socket_addr = Self::to_socket_addr(addr)?;
        let stream = TcpStream::connect(socket_addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.into()))?;
        Self::tune(&stream).map_err(TransportError::ConnectFailed)?;
        Ok(Box::new(TcpMessageSender { stream, open: true }))
    }

    async fn open_data_sender(&self, addr: &Address) -> Result<Box<dyn DataSender>, TransportError> {
        let socket_addr = Self::to_socket_addr(addr)?;
        let stream = TcpStream::connect(socket_addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.into()))?;
        Self::tune(&stream).map_err(TransportError::ConnectFailed)?;
        Ok(Box::new(TcpDataSender { stream, open: true }))
    }
}

async fn accept_messages(
    listener: TcpListener,
    sender: mpsc::Sender<Frame>,
    version: ProtocolVersion,
) {
    loop {
        let (mut stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("message listener for {version} stopped accepting: {e}");
                return;
            }
        };
        if let Err(e) = TcpChannelTemplate::tune(&stream) {
            warn!("failed to tune accepted connection from {peer_addr}: {e}");
        }
        let sender = sender.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut stream).await {
                    Ok(frame) => {
                        if sender.send(frame).await.is_err() {
                            debug!("message receiver dropped for {version}, closing connection");
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("message connection from {peer_addr} closed: {e}");
                        return;
                    }
                }
            }
        });
    }
}

async fn accept_data(
    listener: TcpListener,
    sender: mpsc::Sender<IncomingStream>,
    version: ProtocolVersion,
) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("data listener for {version} stopped accepting: {e}");
                return;
            }
        };
        if let Err(e) = TcpChannelTemplate::tune(&stream) {
            warn!("failed to tune accepted data connection from {peer_addr}: {e}");
        }
        let sender = sender.clone();
        tokio::spawn(async move {
            let (mut read_half, write_half) = stream.into_split();
            let header = match read_data_header(&mut read_half).await {
                Ok(header) => header,
                Err(e) => {
                    debug!("data connection from {peer_addr} dropped before header: {e}");
                    return;
                }
            };
            let length = header.length;
            let incoming = IncomingStream {
                header,
                body: Box::new(read_half.take(length)),
                acker: Box::new(TcpAcker { write_half }),
            };
            if sender.send(incoming).await.is_err() {
                debug!("data receiver dropped for {version}");
            }
        });
    }
}

async fn read_data_header(
    stream: &mut tokio::net::tcp::OwnedReadHalf,
) -> anyhow::Result<DataTransferHeader> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("data header too large: {len} bytes");
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}
