//! The full-duplex, message-oriented connection a session runs over.
//!
//! Handshake, framing, compression and ping/pong belong to the implementation;
//! the session only reads whole messages, writes whole messages and closes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// One whole inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub kind: MessageKind,
    pub data: Bytes,
}

impl Inbound {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            data: Bytes::from(s.into()),
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            data: data.into(),
        }
    }
}

/// Transport-level failure. Fatal to whoever is reading.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed: {0}")]
    Closed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Wait for the next data message. Errors once the connection is gone.
    async fn next_message(&self) -> Result<Inbound, ConnectionError>;

    /// Send one message. Safe to call concurrently with `next_message`.
    async fn write_message(&self, kind: MessageKind, data: Bytes) -> Result<(), ConnectionError>;

    /// Close the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Adapter over an upgraded axum WebSocket. Split so reads and writes
/// don't contend on one lock.
pub struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: AtomicBool,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn next_message(&self) -> Result<Inbound, ConnectionError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Inbound {
                        kind: MessageKind::Text,
                        data: Bytes::copy_from_slice(text.as_str().as_bytes()),
                    });
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    return Ok(Inbound {
                        kind: MessageKind::Binary,
                        data,
                    });
                }
                // axum answers pings itself
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = match frame {
                        Some(f) => format!("close frame {} {}", f.code, f.reason.as_str()),
                        None => "close frame".to_string(),
                    };
                    return Err(ConnectionError::Closed(reason));
                }
                Some(Err(e)) => return Err(ConnectionError::Protocol(e.to_string())),
                None => return Err(ConnectionError::Closed("stream ended".into())),
            }
        }
    }

    async fn write_message(&self, kind: MessageKind, data: Bytes) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed("closed locally".into()));
        }
        let msg = match kind {
            MessageKind::Text => {
                let text = String::from_utf8(Vec::from(data))
                    .map_err(|_| ConnectionError::InvalidUtf8)?;
                WsMessage::Text(text.into())
            }
            MessageKind::Binary => WsMessage::Binary(data),
        };
        self.sink
            .lock()
            .await
            .send(msg)
            .await
            .map_err(|e| ConnectionError::Protocol(e.to_string()))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        // Fails when the peer already closed; that is fine.
        let _ = sink.send(WsMessage::Close(None)).await;
        sink.close()
            .await
            .map_err(|e| ConnectionError::Protocol(e.to_string()))
    }
}

/// In-process connection driven by a [`MemoryPeer`].
pub struct MemoryConnection {
    inbound: Mutex<mpsc::UnboundedReceiver<Result<Inbound, ConnectionError>>>,
    outbound: mpsc::UnboundedSender<Inbound>,
    closed: CancellationToken,
    close_calls: AtomicUsize,
}

/// The remote end of a [`MemoryConnection`].
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Result<Inbound, ConnectionError>>,
    outbound: mpsc::UnboundedReceiver<Inbound>,
    closed: CancellationToken,
}

impl MemoryConnection {
    pub fn pair() -> (Self, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let conn = Self {
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
            closed: closed.clone(),
            close_calls: AtomicUsize::new(0),
        };
        let peer = MemoryPeer {
            inbound: in_tx,
            outbound: out_rx,
            closed,
        };
        (conn, peer)
    }

    /// How many times `close` was invoked, including no-op repeats.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn next_message(&self) -> Result<Inbound, ConnectionError> {
        let mut rx = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ConnectionError::Closed("closed locally".into())),
            msg = rx.recv() => {
                msg.unwrap_or_else(|| Err(ConnectionError::Closed("peer dropped".into())))
            }
        }
    }

    async fn write_message(&self, kind: MessageKind, data: Bytes) -> Result<(), ConnectionError> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed("closed locally".into()));
        }
        self.outbound
            .send(Inbound { kind, data })
            .map_err(|_| ConnectionError::Closed("peer dropped".into()))
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.close_calls.fetch_add(1, Ordering::Relaxed);
        self.closed.cancel();
        Ok(())
    }
}

impl MemoryPeer {
    /// Deliver a text message to the connection. False if it is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound.send(Ok(Inbound::text(text))).is_ok()
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.inbound.send(Ok(Inbound::binary(data))).is_ok()
    }

    /// Make the connection's next read fail with `err`.
    pub fn fail(&self, err: ConnectionError) -> bool {
        self.inbound.send(Err(err)).is_ok()
    }

    /// Wait for the next message written by the connection.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.outbound.recv().await
    }

    /// Stop accepting messages from the connection. Later writes fail as
    /// if the peer went away; reads are unaffected.
    pub fn stop_reading(&mut self) {
        self.outbound.close();
    }

    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.outbound.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
