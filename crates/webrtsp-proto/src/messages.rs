//! Protocol message types

use serde::{Deserialize, Serialize};

/// Broker-assigned identifier of one multiplexed session.
///
/// Unique for the lifetime of one transport connection; the broker re-assigns
/// ids from scratch after a reconnect.
pub type SessionId = u32;

/// Main proxy protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProxyMessage {
    // Authentication (first exchange on a fresh connection)
    AuthRequest {
        name: String,
        token: String,
    },
    AuthAccepted,
    AuthRejected {
        reason: String,
    },

    // Keepalive, broker-driven
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },

    // Session lifecycle
    /// Broker announces a new session to bridge to the local target.
    OpenSession {
        session_id: SessionId,
        /// Optional hint about the remote peer, for diagnostics only.
        target: Option<String>,
    },
    Data {
        session_id: SessionId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Close one session. `reason` is set when the close reports an error,
    /// e.g. the local target refused the connection.
    CloseSession {
        session_id: SessionId,
        reason: Option<String>,
    },
}

impl ProxyMessage {
    /// Session this message belongs to, if it is session scoped.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            ProxyMessage::OpenSession { session_id, .. }
            | ProxyMessage::Data { session_id, .. }
            | ProxyMessage::CloseSession { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }
}

// Bincode maps Vec<u8> through the sequence path by default; serialize data
// payloads as raw byte strings so they round-trip without per-element framing.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
