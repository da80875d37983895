//! In-memory transport for tests
//!
//! Gives tests a broker end that speaks the real wire protocol without any
//! network. Dropping the [`BrokerEnd`] looks to the client like the broker
//! going away mid-connection.

use crate::transport::{Transport, TransportConnector, TransportError, TransportSink, TransportSource};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use webrtsp_proto::{ProxyCodec, ProxyMessage};

/// Create a connected in-memory transport pair: the client-facing transport
/// and the scripted broker end.
pub fn pair(capacity: usize) -> (MemoryTransport, BrokerEnd) {
    let (client_tx, broker_rx) = mpsc::channel(capacity);
    let (broker_tx, client_rx) = mpsc::channel(capacity);

    (
        MemoryTransport {
            tx: client_tx,
            rx: client_rx,
        },
        BrokerEnd {
            tx: broker_tx,
            rx: broker_rx,
            buf: BytesMut::new(),
        },
    )
}

/// Client side of an in-memory transport pair
pub struct MemoryTransport {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl Transport for MemoryTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportSource>) {
        (
            Box::new(MemorySink { tx: Some(self.tx) }),
            Box::new(MemorySource { rx: self.rx }),
        )
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(data)
                .await
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl TransportSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Scripted broker end of an in-memory transport pair
pub struct BrokerEnd {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    buf: BytesMut,
}

impl BrokerEnd {
    /// Send one protocol message to the client.
    pub async fn send(&self, msg: &ProxyMessage) -> Result<(), TransportError> {
        let frame =
            ProxyCodec::encode(msg).map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send raw bytes, bypassing the codec. For malformed-frame tests.
    pub async fn send_raw(&self, data: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(data)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next protocol message from the client.
    ///
    /// Returns `None` on clean close or an undecodable stream.
    pub async fn recv(&mut self) -> Option<ProxyMessage> {
        loop {
            match ProxyCodec::decode(&mut self.buf) {
                Ok(Some(msg)) => return Some(msg),
                Ok(None) => {
                    let chunk = self.rx.recv().await?;
                    self.buf.extend_from_slice(&chunk);
                }
                Err(_) => return None,
            }
        }
    }
}

/// Connector handing out a scripted sequence of in-memory transports.
///
/// Once the sequence is exhausted every further connect attempt fails, which
/// is what reconnect tests want.
pub struct MemoryConnector {
    transports: Mutex<VecDeque<MemoryTransport>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(transports: Vec<MemoryTransport>) -> Self {
        Self {
            transports: Mutex::new(transports.into()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of connect attempts made so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let next = match self.transports.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => None,
        };

        match next {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}
