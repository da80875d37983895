//! Authentication handshake
//!
//! First exchange on every fresh broker connection: exactly one request,
//! exactly one response, bounded by a timeout. Nothing else is sent or
//! processed until it succeeds.

use crate::config::ClientIdentity;
use crate::transport::{TransportError, TransportSink, TransportSource};
use bytes::BytesMut;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use webrtsp_proto::{CodecError, ProxyCodec, ProxyMessage};

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Authentication rejected: {0}")]
    Rejected(String),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Connection closed during handshake")]
    ConnectionClosed,

    #[error("Unexpected message during handshake: {0:?}")]
    Unexpected(ProxyMessage),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Send the identity and await the broker's verdict.
///
/// Succeeds only on an explicit `AuthAccepted`; every other outcome
/// (rejection, malformed response, closed connection, timeout) fails the
/// handshake and the caller takes the normal reconnect path.
///
/// On success the returned buffer holds any bytes received after the
/// verdict. The broker may coalesce its first session frames with it; the
/// caller must hand those to the multiplexer, not drop them.
pub async fn authenticate(
    sink: &mut dyn TransportSink,
    source: &mut dyn TransportSource,
    identity: &ClientIdentity,
    timeout: Duration,
) -> Result<BytesMut, HandshakeError> {
    let request = ProxyMessage::AuthRequest {
        name: identity.name.clone(),
        token: identity.auth_token.clone(),
    };
    sink.send(ProxyCodec::encode(&request)?).await?;
    debug!(name = %identity.name, "sent authentication request");

    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = BytesMut::new();
    loop {
        if let Some(msg) = ProxyCodec::decode(&mut buf)? {
            return match msg {
                ProxyMessage::AuthAccepted => {
                    debug!(name = %identity.name, "authentication accepted");
                    Ok(buf)
                }
                ProxyMessage::AuthRejected { reason } => Err(HandshakeError::Rejected(reason)),
                other => Err(HandshakeError::Unexpected(other)),
            };
        }

        let received = tokio::time::timeout_at(deadline, source.recv())
            .await
            .map_err(|_| HandshakeError::Timeout)??;
        let Some(data) = received else {
            return Err(HandshakeError::ConnectionClosed);
        };
        buf.extend_from_slice(&data);
    }
}
