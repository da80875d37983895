//! Stream multiplexer for one connection generation
//!
//! Owns the two halves of an authenticated transport: a receive loop that
//! dispatches broker frames to sessions, and a single writer task that
//! drains the shared outbound queue. The writer is the only thing that ever
//! touches the sink, which keeps each relay's frames in order on the wire.

use crate::config::TunnelConfig;
use crate::connector::LocalConnector;
use crate::relay;
use crate::session::{DataRoute, Generation, SessionMap};
use crate::transport::{TransportError, TransportSink, TransportSource};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use webrtsp_proto::{CodecError, ProxyCodec, ProxyMessage, SessionId};

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MultiplexError {
    #[error("Outbound channel closed")]
    ChannelClosed,
}

/// How a generation's run ended
#[derive(Debug)]
pub enum Disconnect {
    /// Cancelled from above; no reconnect
    Shutdown,
    /// Broker closed the connection cleanly
    RemoteClosed,
    /// Transport failed mid-connection
    Failed(TransportError),
}

/// Handle onto the shared outbound queue.
///
/// Every producer (relays, keepalive replies, failure notifications) goes
/// through this bounded channel; awaiting on it is the engine's
/// backpressure toward a slow broker link.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ProxyMessage>,
}

impl Outbound {
    pub(crate) fn new(tx: mpsc::Sender<ProxyMessage>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: ProxyMessage) -> Result<(), MultiplexError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| MultiplexError::ChannelClosed)
    }
}

/// Frame router for one connection generation
pub struct Multiplexer {
    generation: Generation,
    config: Arc<TunnelConfig>,
    sessions: Arc<SessionMap>,
    cancel: CancellationToken,
}

impl Multiplexer {
    pub fn new(generation: Generation, config: Arc<TunnelConfig>, cancel: CancellationToken) -> Self {
        Self {
            generation,
            config,
            sessions: Arc::new(SessionMap::new()),
            cancel,
        }
    }

    pub fn sessions(&self) -> Arc<SessionMap> {
        self.sessions.clone()
    }

    /// Run until the transport drops, fails, or the generation is cancelled.
    /// `carryover` holds any bytes received after the handshake verdict but
    /// before this took over the source. Teardown of every session task
    /// happens before this returns, bounded by the configured grace period.
    pub async fn run(
        self,
        sink: Box<dyn TransportSink>,
        source: Box<dyn TransportSource>,
        carryover: BytesMut,
    ) -> Disconnect {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_frames);
        let outbound = Outbound::new(outbound_tx);
        let send_failed = Arc::new(AtomicBool::new(false));

        let mut tasks: JoinSet<()> = JoinSet::new();
        tasks.spawn(writer_task(
            self.generation,
            sink,
            outbound_rx,
            self.cancel.clone(),
            send_failed.clone(),
        ));

        debug!(generation = self.generation, "multiplexer running");

        let end = self
            .receive_loop(carryover, source, &outbound, &mut tasks, &send_failed)
            .await;

        self.teardown(tasks).await;
        end
    }

    async fn receive_loop(
        &self,
        mut buf: BytesMut,
        mut source: Box<dyn TransportSource>,
        outbound: &Outbound,
        tasks: &mut JoinSet<()>,
        send_failed: &AtomicBool,
    ) -> Disconnect {
        // Frames coalesced behind the handshake verdict come first.
        if let Err(end) = self.drain_frames(&mut buf, outbound, tasks).await {
            return end;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return if send_failed.load(Ordering::SeqCst) {
                        Disconnect::Failed(TransportError::ConnectionClosed)
                    } else {
                        Disconnect::Shutdown
                    };
                }
                received = source.recv() => match received {
                    Ok(Some(data)) => {
                        buf.extend_from_slice(&data);
                        if let Err(end) = self.drain_frames(&mut buf, outbound, tasks).await {
                            return end;
                        }
                    }
                    Ok(None) => return Disconnect::RemoteClosed,
                    Err(e) => return Disconnect::Failed(e),
                }
            }
        }
    }

    /// Decode and dispatch every complete frame in the buffer.
    /// Returns the disconnect cause when the run must end.
    async fn drain_frames(
        &self,
        buf: &mut BytesMut,
        outbound: &Outbound,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), Disconnect> {
        loop {
            match ProxyCodec::decode(buf) {
                Ok(Some(msg)) => {
                    if !self.dispatch(msg, outbound, tasks).await {
                        return Err(Disconnect::Failed(TransportError::ConnectionClosed));
                    }
                }
                Ok(None) => return Ok(()),
                Err(e @ CodecError::FrameTooLarge(..)) => {
                    // The length header cannot be trusted, so neither can
                    // anything after it. Fail the connection.
                    error!(generation = self.generation, error = %e, "unrecoverable framing error");
                    return Err(Disconnect::Failed(TransportError::ProtocolError(
                        e.to_string(),
                    )));
                }
                Err(e) => {
                    // The decoder consumed exactly the bad frame; frames
                    // queued behind it are still intact.
                    warn!(generation = self.generation, error = %e, "dropping undecodable frame");
                }
            }
        }
    }

    async fn dispatch(
        &self,
        msg: ProxyMessage,
        outbound: &Outbound,
        tasks: &mut JoinSet<()>,
    ) -> bool {
        match msg {
            ProxyMessage::Ping { timestamp } => {
                trace!(generation = self.generation, timestamp, "keepalive ping");
                outbound
                    .send(ProxyMessage::Pong { timestamp })
                    .await
                    .is_ok()
            }
            ProxyMessage::Pong { .. } => true,
            ProxyMessage::OpenSession { session_id, target } => {
                self.open_session(session_id, target, outbound, tasks);
                true
            }
            ProxyMessage::Data { session_id, data } => {
                self.route_data(session_id, Bytes::from(data)).await;
                true
            }
            ProxyMessage::CloseSession { session_id, reason } => {
                if self.sessions.begin_close(session_id) {
                    debug!(
                        generation = self.generation,
                        session_id,
                        reason = reason.as_deref().unwrap_or("-"),
                        "broker closed session"
                    );
                } else {
                    warn!(
                        generation = self.generation,
                        session_id, "CloseSession for unknown session"
                    );
                }
                true
            }
            other => {
                warn!(
                    generation = self.generation,
                    message = ?other,
                    "unexpected control message after handshake"
                );
                true
            }
        }
    }

    fn open_session(
        &self,
        session_id: SessionId,
        target: Option<String>,
        outbound: &Outbound,
        tasks: &mut JoinSet<()>,
    ) {
        let (data_tx, data_rx) = mpsc::channel(self.config.session_buffer_frames);
        if !self.sessions.open(session_id, data_tx) {
            warn!(
                generation = self.generation,
                session_id, "duplicate OpenSession for active session"
            );
            return;
        }

        debug!(
            generation = self.generation,
            session_id,
            target = target.as_deref().unwrap_or("-"),
            "broker opened session"
        );

        tasks.spawn(handle_session(
            self.generation,
            session_id,
            self.config.clone(),
            self.sessions.clone(),
            outbound.clone(),
            data_rx,
            self.cancel.clone(),
        ));
    }

    async fn route_data(&self, session_id: SessionId, payload: Bytes) {
        match self.sessions.route_data(session_id) {
            DataRoute::Stream(tx) => {
                // Bounded per-session buffer: when the relay's local write
                // side stalls, frame consumption pauses here instead of
                // dropping payload.
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    res = tx.send(payload) => {
                        if res.is_err() {
                            debug!(
                                generation = self.generation,
                                session_id, "session ended, dropping late data frame"
                            );
                        }
                    }
                }
            }
            DataRoute::Draining => {
                debug!(
                    generation = self.generation,
                    session_id, "data after close, dropping frame"
                );
            }
            DataRoute::Unknown => {
                warn!(
                    generation = self.generation,
                    session_id, "data for unknown session, dropping frame"
                );
            }
        }
    }

    async fn teardown(&self, mut tasks: JoinSet<()>) {
        self.cancel.cancel();

        let aborted = self.sessions.abort_all();
        if aborted > 0 {
            info!(
                generation = self.generation,
                sessions = aborted,
                "aborted active sessions"
            );
        }

        let drained = tokio::time::timeout(self.config.teardown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                generation = self.generation,
                "teardown grace period elapsed, aborting remaining tasks"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        debug!(generation = self.generation, "generation torn down");
    }
}

/// Drains the outbound queue onto the sink. The single writer for the whole
/// generation; a send failure cancels the generation.
async fn writer_task(
    generation: Generation,
    mut sink: Box<dyn TransportSink>,
    mut outbound_rx: mpsc::Receiver<ProxyMessage>,
    cancel: CancellationToken,
    send_failed: Arc<AtomicBool>,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let frame = match ProxyCodec::encode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                error!(generation, error = %e, "failed to encode outbound frame");
                continue;
            }
        };

        if let Err(e) = sink.send(frame).await {
            error!(generation, error = %e, "transport send failed");
            send_failed.store(true, Ordering::SeqCst);
            cancel.cancel();
            break;
        }
    }

    let _ = sink.close().await;
}

/// One session's life: local connect, then relay until done.
async fn handle_session(
    generation: Generation,
    session_id: SessionId,
    config: Arc<TunnelConfig>,
    sessions: Arc<SessionMap>,
    outbound: Outbound,
    data_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let connector = LocalConnector::new(config.target.clone(), config.local_connect_timeout);

    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        res = connector.connect() => res,
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            warn!(generation, session_id, error = %e, "local connect failed");
            // Required side effect: the broker must learn the session is
            // dead so its own client is not left waiting.
            if sessions.fail(session_id) {
                let _ = outbound
                    .send(ProxyMessage::CloseSession {
                        session_id,
                        reason: Some(e.to_string()),
                    })
                    .await;
            }
            return;
        }
    };

    if !sessions.establish(session_id) {
        // Closed or torn down while the connect was in flight; the fresh
        // stream drops here instead of relaying for a dead session.
        sessions.finish(session_id);
        return;
    }
    debug!(generation, session_id, "session established");

    match relay::run(
        generation,
        session_id,
        stream,
        data_rx,
        outbound.clone(),
        cancel.clone(),
    )
    .await
    {
        Ok((sent, received)) => {
            debug!(
                generation,
                session_id,
                bytes_to_broker = sent,
                bytes_to_local = received,
                "session finished"
            );
        }
        Err(e) => {
            warn!(generation, session_id, error = %e, "session relay failed");
            if !cancel.is_cancelled() {
                let _ = outbound
                    .send(ProxyMessage::CloseSession {
                        session_id,
                        reason: Some(e.to_string()),
                    })
                    .await;
            }
        }
    }

    if !cancel.is_cancelled() {
        sessions.finish(session_id);
    }
}
