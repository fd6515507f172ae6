//! Transport abstraction traits.
//!
//! The upstream bridge and the client facade both hold one outbound
//! connection and reconnect it when it drops. They only see these traits, so
//! the WebSocket transport can be swapped for the in-memory one in tests.

use async_trait::async_trait;
use bytes::Bytes;
use relay_protocol::{codec, Envelope, EnvelopeCodec, ProtocolError};
use std::fmt;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Could not establish a connection.
    #[error("Connect to {endpoint} failed: {reason}")]
    ConnectFailed {
        /// Target that was dialed.
        endpoint: String,
        /// Underlying failure.
        reason: String,
    },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One frame as it travels over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl RawFrame {
    /// Encode an envelope as a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(envelope: &Envelope) -> Result<Self, ProtocolError> {
        codec::encode(envelope).map(RawFrame::Text)
    }

    /// Decode this frame in the standard encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or malformed.
    pub fn decode(&self, codec: &EnvelopeCodec) -> Result<Envelope, ProtocolError> {
        match self {
            RawFrame::Text(text) => codec.decode_text(text),
            RawFrame::Binary(data) => codec.decode_binary(data),
        }
    }

    /// Decode this frame, accepting the legacy text encoding as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or malformed.
    pub fn decode_lenient(&self, codec: &EnvelopeCodec) -> Result<Envelope, ProtocolError> {
        match self {
            RawFrame::Text(text) => codec.decode_text_lenient(text),
            RawFrame::Binary(data) => codec.decode_binary(data),
        }
    }

    /// Frame size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            RawFrame::Text(text) => text.len(),
            RawFrame::Binary(data) => data.len(),
        }
    }

    /// Whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Observable state of an outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A connect attempt is in flight.
    Connecting,
    /// The connection is usable.
    Open,
    /// No connection; a reconnect is scheduled.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Open => f.write_str("open"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// Something that can dial a single remote endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> &str;
}

/// An open outbound connection.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<RawFrame>, TransportError>;

    /// Send a frame.
    async fn send(&mut self, frame: RawFrame) -> Result<(), TransportError>;

    /// Encode and send an envelope as a text frame.
    async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = RawFrame::encode(envelope)?;
        self.send(frame).await
    }

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}
