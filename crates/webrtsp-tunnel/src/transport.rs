//! Transport traits for the broker connection
//!
//! The broker link is a framed, ordered, reliable message channel. The engine
//! reads and writes it from different tasks, so a connected transport splits
//! into independent sink and source halves.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Connect timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Writing half of a connected transport
#[async_trait]
pub trait TransportSink: Send {
    /// Send one framed message
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Reading half of a connected transport
#[async_trait]
pub trait TransportSource: Send {
    /// Receive one framed message; `Ok(None)` means the remote closed cleanly
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// A connected transport to the broker
pub trait Transport: Send {
    /// Split into independently owned halves so the reader loop and the
    /// serialized writer can run concurrently.
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportSource>);
}

/// Produces a fresh transport for every connection generation
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}
