//! WebSocket transport implementation

use crate::transport::{Transport, TransportConnector, TransportError, TransportSink, TransportSource};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Broker endpoint, `ws://` or `wss://`
    pub url: String,
    /// Deadline for the TCP + TLS + upgrade handshake
    pub connect_timeout: Duration,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Connects WebSocket transports to the configured broker endpoint
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        debug!("Connecting to WebSocket: {}", self.config.url);

        let (ws_stream, _response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(&self.config.url))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::WebSocketError(e.to_string()))?;

        debug!("WebSocket connected");

        Ok(Box::new(WebSocketTransport { stream: ws_stream }))
    }
}

/// WebSocket transport
pub struct WebSocketTransport {
    stream: WsStream,
}

impl Transport for WebSocketTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportSource>) {
        let (sink, source) = self.stream.split();
        (Box::new(WsSink { sink }), Box::new(WsSource { source }))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        trace!("Sending {} bytes via WebSocket", data.len());

        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("Closing WebSocket connection");

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::WebSocketError(e.to_string()))
    }
}

struct WsSource {
    source: SplitStream<WsStream>,
}

#[async_trait]
impl TransportSource for WsSource {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Binary(data))) => {
                    trace!("Received {} bytes via WebSocket", data.len());
                    return Ok(Some(Bytes::from(data)));
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("WebSocket closed by remote");
                    return Ok(None);
                }
                // tungstenite queues the pong reply internally; it goes out
                // with the next write on the sink half.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(msg)) => {
                    debug!("Ignoring WebSocket message type: {:?}", msg);
                    continue;
                }
                Some(Err(e)) => {
                    return Err(TransportError::WebSocketError(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
