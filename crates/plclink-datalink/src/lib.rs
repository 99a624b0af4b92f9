//! Byte-stream transport for the plclink engine.
//!
//! A [`DataLink`] moves whole Modbus-TCP ADUs: the engine hands it encoded
//! frames through [`DataLink::send`] and consumes inbound frames and link
//! state flips from the event channel returned by [`DataLink::connect`].

#![forbid(unsafe_code)]

use async_trait::async_trait;
use plclink_core::EncodeError;
use plclink_core::encoding::Reader;
use plclink_core::frame::tcp::{self, MbapHeader};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub mod server;
pub mod sim;
pub use server::{ModbusService, ModbusTcpServer, ServiceError};
pub use sim::{InMemoryModbusService, RegisterBank};

#[derive(Debug, Error)]
pub enum DataLinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("link is not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
}

/// Something the link observed on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One complete ADU, header included.
    Frame(Vec<u8>),
    /// The link came up (`true`) or went down (`false`).
    State(bool),
}

#[async_trait]
pub trait DataLink: Send + Sync {
    /// Open the link and return the stream of inbound events for it.
    ///
    /// The receiver ends when the link is torn down. Calling `connect` on a
    /// link that is already up replaces the old session.
    async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, DataLinkError>;

    /// Write one complete ADU.
    async fn send(&self, frame: &[u8]) -> Result<(), DataLinkError>;

    /// Close the link. Safe to call when already closed.
    async fn disconnect(&self);
}

#[derive(Debug)]
struct Session {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// [`DataLink`] over a plain TCP socket.
///
/// Inbound bytes are reassembled into ADUs by a reader task using the MBAP
/// length field. No reconnection is attempted.
#[derive(Debug, Default)]
pub struct ModbusTcpTransport {
    session: Mutex<Option<Session>>,
}

impl ModbusTcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn attach(&self, stream: TcpStream) -> mpsc::UnboundedReceiver<LinkEvent> {
        let (read_half, writer) = stream.into_split();
        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(LinkEvent::State(true));
        let reader = tokio::spawn(read_loop(read_half, events));

        let previous = self.session.lock().await.replace(Session { writer, reader });
        if let Some(old) = previous {
            close_session(old).await;
        }
        rx
    }
}

async fn close_session(mut session: Session) {
    session.reader.abort();
    if let Err(err) = session.writer.shutdown().await {
        debug!(error = %err, "tcp shutdown failed");
    }
}

async fn read_exact_or_connection_closed(
    stream: &mut OwnedReadHalf,
    buf: &mut [u8],
) -> Result<(), DataLinkError> {
    if let Err(err) = stream.read_exact(buf).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(DataLinkError::ConnectionClosed);
        }
        return Err(DataLinkError::Io(err));
    }
    Ok(())
}

/// Read ADUs until the peer goes away. Returns `Ok` when nobody listens.
async fn pump_frames(
    stream: &mut OwnedReadHalf,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> Result<(), DataLinkError> {
    loop {
        let mut head = [0u8; tcp::MBAP_HEADER_LEN];
        read_exact_or_connection_closed(stream, &mut head).await?;

        let header = MbapHeader::read(&mut Reader::new(&head))
            .map_err(|_| DataLinkError::InvalidFrame("short mbap header"))?;
        // Without a usable length the stream cannot be resynchronised.
        let frame_len = header
            .frame_len()
            .ok_or(DataLinkError::InvalidFrame("mbap length out of range"))?;

        let mut frame = vec![0u8; frame_len];
        frame[..tcp::MBAP_HEADER_LEN].copy_from_slice(&head);
        read_exact_or_connection_closed(stream, &mut frame[tcp::MBAP_HEADER_LEN..]).await?;

        trace!(
            transaction_id = header.transaction_id,
            unit_id = header.unit_id,
            pdu_len = frame_len - tcp::MBAP_HEADER_LEN,
            "received modbus tcp frame"
        );
        if events.send(LinkEvent::Frame(frame)).is_err() {
            return Ok(());
        }
    }
}

async fn read_loop(mut stream: OwnedReadHalf, events: mpsc::UnboundedSender<LinkEvent>) {
    match pump_frames(&mut stream, &events).await {
        Ok(()) => return,
        Err(DataLinkError::ConnectionClosed) => debug!("peer closed modbus tcp link"),
        Err(err) => warn!(error = %err, "modbus tcp link failed"),
    }
    let _ = events.send(LinkEvent::State(false));
}

#[async_trait]
impl DataLink for ModbusTcpTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, DataLinkError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        debug!(host, port, "modbus tcp link established");
        Ok(self.attach(stream).await)
    }

    async fn send(&self, frame: &[u8]) -> Result<(), DataLinkError> {
        let mut session = self.session.lock().await;
        let session = session.as_mut().ok_or(DataLinkError::NotConnected)?;
        trace!(frame_len = frame.len(), "sending modbus tcp frame");
        session.writer.write_all(frame).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            close_session(session).await;
        }
    }
}
