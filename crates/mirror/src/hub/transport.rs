//! Framed envelope I/O over one upgraded connection.
//!
//! A connection is split into an [`EnvelopeSink`] (writes) and an
//! [`EnvelopeSource`] (reads) so the host's two loops can own one half each.
//! The WebSocket adapters are what the HTTP layer hands to the hub; the
//! channel adapters back the hub's tests and any embedding that does not speak
//! WebSocket.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::debug;
use mirror_protocol::Envelope;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors writing an envelope to a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write frame: {0}")]
    Send(String),

    #[error("connection closed")]
    Closed,
}

/// Outcome of reading one frame from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed envelope.
    Envelope(Envelope),
    /// A data frame that did not decode as an envelope.
    Malformed(String),
    /// A read error that does not by itself end the connection.
    Interrupted(String),
    /// Control frame with nothing to forward.
    Ignored,
    /// Close frame or end of stream.
    Closed,
}

/// Write half of a connection.
#[async_trait]
pub trait EnvelopeSink: Send {
    async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Close the connection. Errors are ignored; the peer may already be gone.
    async fn close(&mut self);
}

/// Read half of a connection.
#[async_trait]
pub trait EnvelopeSource: Send {
    async fn next_inbound(&mut self) -> Inbound;
}

// ============================================================================
// WebSocket
// ============================================================================

/// Split an upgraded WebSocket into envelope halves.
pub fn split_websocket(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (
        WsSink { inner: sink },
        WsSource {
            inner: stream,
            reads: ReadState::default(),
        },
    )
}

pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl EnvelopeSink for WsSink {
    async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let json = envelope.to_json()?;
        self.inner
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}

pub struct WsSource {
    inner: SplitStream<WebSocket>,
    reads: ReadState,
}

#[async_trait]
impl EnvelopeSource for WsSource {
    async fn next_inbound(&mut self) -> Inbound {
        if self.reads.broken {
            return Inbound::Closed;
        }
        let frame = self.inner.next().await;
        self.reads.classify(frame)
    }
}

/// Classifies socket reads.
///
/// The socket does not recover from a read error, so after the first one
/// every read reports `Closed` instead of erroring forever.
#[derive(Debug, Default)]
struct ReadState {
    broken: bool,
}

impl ReadState {
    fn classify(&mut self, frame: Option<Result<Message, axum::Error>>) -> Inbound {
        if self.broken {
            return Inbound::Closed;
        }

        match frame {
            None => Inbound::Closed,
            Some(Ok(Message::Text(text))) => decode(Envelope::from_json(text.as_str())),
            Some(Ok(Message::Binary(data))) => decode(Envelope::from_slice(&data)),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Inbound::Ignored,
            Some(Ok(Message::Close(_))) => Inbound::Closed,
            Some(Err(e)) => {
                self.broken = true;
                Inbound::Interrupted(e.to_string())
            }
        }
    }
}

fn decode(result: Result<Envelope, serde_json::Error>) -> Inbound {
    match result {
        Ok(envelope) => Inbound::Envelope(envelope),
        Err(e) => Inbound::Malformed(e.to_string()),
    }
}

// ============================================================================
// In-memory channels
// ============================================================================

/// Sink that forwards envelopes into a channel.
///
/// Writes fail once the returned receiver is dropped, which is how tests
/// simulate a peer that went away.
pub fn channel_sink() -> (ChannelSink, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx: Some(tx) }, rx)
}

/// Source fed by the returned sender. Dropping the sender reads as `Closed`.
pub fn channel_source() -> (mpsc::UnboundedSender<Inbound>, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelSource { rx })
}

pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
}

#[async_trait]
impl EnvelopeSink for ChannelSink {
    async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(envelope.clone()).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl EnvelopeSource for ChannelSource {
    async fn next_inbound(&mut self) -> Inbound {
        self.rx.recv().await.unwrap_or(Inbound::Closed)
    }
}
