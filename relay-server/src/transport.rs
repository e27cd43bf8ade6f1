//! Frame-level read/write capability for one live connection, plus its two
//! implementations: the real websocket and an in-memory test double.
//!
//! A transport is split into a reader half and a writer half the moment it is
//! created, matching the underlying `axum` websocket's own split into a
//! `SplitStream`/`SplitSink`. The session owns each half exclusively from a
//! separate task; nothing else touches either one.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{Addr, Message};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Why `read_message` failed to produce a frame.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("peer vanished without a close frame")]
    UnexpectedClose,
    #[error("peer closed the connection")]
    NormalClose,
    #[error("malformed frame: {0}")]
    Protocol(String),
}

/// Why a write to the peer failed. Always fatal to the session that hit it.
#[derive(Debug, Error)]
#[error("transport write failed: {0}")]
pub struct WriteError(pub String);

#[async_trait]
pub trait TransportReader: Send {
    /// Blocks until a frame arrives or `deadline` elapses since the call
    /// started. §5's read deadline is refreshed on every inbound frame
    /// (including pongs), which this achieves by re-arming the timeout on
    /// every loop iteration inside an implementation rather than wrapping
    /// one call to this method in an outer, coarser timeout.
    async fn read_message(&mut self, deadline: Duration) -> Result<Message, ReadError>;
}

#[async_trait]
pub trait TransportWriter: Send {
    async fn write_message(&mut self, message: &Message) -> Result<(), WriteError>;
    async fn write_ping(&mut self) -> Result<(), WriteError>;
    /// Best-effort close frame. Never retried, never surfaces an error: by
    /// the time we write one we are already tearing the session down.
    async fn write_close(&mut self, reason: &str);
    /// Idempotent release of underlying OS resources.
    async fn close(&mut self);
}

pub fn is_normal_close(err: &ReadError) -> bool {
    matches!(err, ReadError::NormalClose)
}

/// A not-yet-admitted transport, handed to the router by the admission path.
pub struct PendingTransport {
    pub addr: Addr,
    pub reader: Box<dyn TransportReader>,
    pub writer: Box<dyn TransportWriter>,
}

// --- axum websocket implementation -----------------------------------------

pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

pub struct WsWriter {
    sink: SplitSink<WebSocket, WsMessage>,
    closed: bool,
}

/// Splits an upgraded websocket into the reader/writer halves the session
/// operates on. `addr` has already been allocated by the admission path.
pub fn split(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader { stream }, WsWriter { sink, closed: false })
}

#[async_trait]
impl TransportReader for WsReader {
    async fn read_message(&mut self, deadline: Duration) -> Result<Message, ReadError> {
        loop {
            // Re-armed every iteration, so a pong (or any other frame) that
            // arrives just before the deadline refreshes it for the next
            // frame instead of letting a stale clock keep running underneath.
            let next = match tokio::time::timeout(deadline, self.stream.next()).await {
                Ok(next) => next,
                Err(_elapsed) => return Err(ReadError::UnexpectedClose),
            };
            match next {
                None => return Err(ReadError::UnexpectedClose),
                Some(Err(err)) => {
                    tracing::warn!(%err, "websocket read error");
                    return Err(ReadError::UnexpectedClose);
                }
                Some(Ok(WsMessage::Close(_))) => return Err(ReadError::NormalClose),
                Some(Ok(WsMessage::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|err| ReadError::Protocol(err.to_string()));
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    return serde_json::from_slice(&bytes)
                        .map_err(|err| ReadError::Protocol(err.to_string()));
                }
                // Ping/Pong refresh the deadline (the loop back round) but
                // carry no application content for us to route.
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
            }
        }
    }
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn write_message(&mut self, message: &Message) -> Result<(), WriteError> {
        let text = serde_json::to_string(message).map_err(|err| WriteError(err.to_string()))?;
        self.sink
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| WriteError(err.to_string()))
    }

    async fn write_ping(&mut self) -> Result<(), WriteError> {
        self.sink
            .send(WsMessage::Ping(Vec::new().into()))
            .await
            .map_err(|err| WriteError(err.to_string()))
    }

    async fn write_close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        let frame = axum::extract::ws::CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: reason.to_string().into(),
        };
        let _ = self.sink.send(WsMessage::Close(Some(frame))).await;
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.sink.close().await;
    }
}

// --- in-memory test double --------------------------------------------------

/// What a [`FakeTransport`]'s writer recorded, for the test driving it.
#[derive(Debug, Clone)]
pub enum RecordedFrame {
    Message(Message),
    Ping,
    Close(String),
}

pub struct FakeReader {
    inbound: mpsc::Receiver<Message>,
}

pub struct FakeWriter {
    outbound: mpsc::Sender<RecordedFrame>,
    closed: Arc<AtomicBool>,
}

/// The test-facing handle: feed client frames in, observe what the session
/// wrote back out, and check whether it ever called `close()`.
pub struct FakeTransportDriver {
    pub inbound: mpsc::Sender<Message>,
    pub outbound: mpsc::Receiver<RecordedFrame>,
    closed: Arc<AtomicBool>,
}

impl FakeTransportDriver {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Builds a connected pair: a [`PendingTransport`] ready to hand to the
/// router, and a [`FakeTransportDriver`] the test uses to puppet the peer.
pub fn fake_transport(addr: impl Into<Addr>) -> (PendingTransport, FakeTransportDriver) {
    let (inbound_tx, inbound_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
    let (outbound_tx, outbound_rx) = mpsc::channel(protocol::CHANNEL_BUFFER_SIZE);
    let closed = Arc::new(AtomicBool::new(false));

    let transport = PendingTransport {
        addr: addr.into(),
        reader: Box::new(FakeReader { inbound: inbound_rx }),
        writer: Box::new(FakeWriter {
            outbound: outbound_tx,
            closed: closed.clone(),
        }),
    };
    let driver = FakeTransportDriver {
        inbound: inbound_tx,
        outbound: outbound_rx,
        closed,
    };
    (transport, driver)
}

#[async_trait]
impl TransportReader for FakeReader {
    async fn read_message(&mut self, deadline: Duration) -> Result<Message, ReadError> {
        match tokio::time::timeout(deadline, self.inbound.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ReadError::NormalClose),
            Err(_elapsed) => Err(ReadError::UnexpectedClose),
        }
    }
}

#[async_trait]
impl TransportWriter for FakeWriter {
    async fn write_message(&mut self, message: &Message) -> Result<(), WriteError> {
        self.outbound
            .send(RecordedFrame::Message(message.clone()))
            .await
            .map_err(|_| WriteError("fake transport driver dropped".to_string()))
    }

    async fn write_ping(&mut self) -> Result<(), WriteError> {
        self.outbound
            .send(RecordedFrame::Ping)
            .await
            .map_err(|_| WriteError("fake transport driver dropped".to_string()))
    }

    async fn write_close(&mut self, reason: &str) {
        let _ = self.outbound.send(RecordedFrame::Close(reason.to_string())).await;
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
