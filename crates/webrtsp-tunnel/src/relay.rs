//! Bidirectional byte pump between one session and its local connection
//!
//! Both directions run concurrently until either side closes, an error
//! occurs, or the generation is torn down. Backpressure comes from the
//! bounded channels in both directions: a saturated outbound queue pauses
//! local reads, a stalled local write pauses frame consumption.

use crate::multiplexer::Outbound;
use crate::session::Generation;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use webrtsp_proto::{ProxyMessage, SessionId};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Local read failed: {0}")]
    LocalRead(std::io::Error),

    #[error("Local write failed: {0}")]
    LocalWrite(std::io::Error),

    #[error("Control channel closed")]
    ChannelClosed,
}

/// Pump bytes between the local connection and the multiplexed stream until
/// either side closes or `cancel` fires.
///
/// Returns (bytes sent to broker, bytes written to local connection). The
/// local connection is closed when this returns, the stream halves being
/// dropped here.
pub async fn run<S>(
    generation: Generation,
    session_id: SessionId,
    stream: S,
    mut inbound: mpsc::Receiver<Bytes>,
    outbound: Outbound,
    cancel: CancellationToken,
) -> Result<(u64, u64), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Child token so an error in one direction stops the other without
    // touching the rest of the generation.
    let stop = cancel.child_token();
    let (mut local_read, mut local_write) = tokio::io::split(stream);

    let to_broker = {
        let stop = stop.clone();
        let outbound = outbound.clone();
        async move {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            let mut total = 0u64;
            loop {
                let read = tokio::select! {
                    _ = stop.cancelled() => return Ok(total),
                    res = local_read.read(&mut buffer) => res,
                };
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        stop.cancel();
                        return Err(RelayError::LocalRead(e));
                    }
                };
                if n == 0 {
                    debug!(generation, session_id, "local EOF, half-closing session");
                    let _ = outbound
                        .send(ProxyMessage::CloseSession {
                            session_id,
                            reason: None,
                        })
                        .await;
                    return Ok(total);
                }

                trace!(generation, session_id, bytes = n, "local -> broker");
                let msg = ProxyMessage::Data {
                    session_id,
                    data: buffer[..n].to_vec(),
                };
                // Bounded queue: pauses here when the broker link is saturated.
                let sent = tokio::select! {
                    _ = stop.cancelled() => return Ok(total),
                    res = outbound.send(msg) => res,
                };
                if sent.is_err() {
                    stop.cancel();
                    return Err(RelayError::ChannelClosed);
                }
                total += n as u64;
            }
        }
    };

    let to_local = {
        let stop = stop.clone();
        async move {
            let mut total = 0u64;
            loop {
                let chunk = tokio::select! {
                    _ = stop.cancelled() => return Ok(total),
                    chunk = inbound.recv() => chunk,
                };
                let Some(chunk) = chunk else {
                    // Remote half-closed; propagate to the local write side.
                    debug!(generation, session_id, "remote close, shutting down local write");
                    let _ = local_write.shutdown().await;
                    return Ok(total);
                };

                trace!(generation, session_id, bytes = chunk.len(), "broker -> local");
                if let Err(e) = local_write.write_all(&chunk).await {
                    stop.cancel();
                    return Err(RelayError::LocalWrite(e));
                }
                total += chunk.len() as u64;
            }
        }
    };

    let (sent, received) = tokio::join!(to_broker, to_local);
    let result = match (sent, received) {
        (Ok(s), Ok(r)) => Ok((s, r)),
        (Err(e), _) | (_, Err(e)) => Err(e),
    };

    debug!(generation, session_id, ok = result.is_ok(), "relay finished");
    result
}
