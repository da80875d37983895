//! Tunnel configuration value types

use std::fmt;
use std::time::Duration;

/// Identity presented to the broker on every authentication attempt.
///
/// Both fields are validated non-empty by the bootstrap layer before the
/// core ever runs.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub name: String,
    pub auth_token: String,
}

/// Address of the local service every session is bridged to.
#[derive(Debug, Clone)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
}

impl TargetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Tunnel engine configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Identity for the auth handshake
    pub identity: ClientIdentity,
    /// Local service sessions are bridged to
    pub target: TargetAddress,
    /// Fixed delay between a disconnect and the next connect attempt
    pub reconnect_delay: Duration,
    /// Deadline for the broker to answer the auth request
    pub handshake_timeout: Duration,
    /// Deadline for one local TCP connect
    pub local_connect_timeout: Duration,
    /// How long generation teardown may take before remaining tasks are aborted
    pub teardown_grace: Duration,
    /// Capacity of the shared outbound frame queue (backpressure bound for relays)
    pub outbound_queue_frames: usize,
    /// Per-session inbound frame buffer (backpressure bound toward the broker)
    pub session_buffer_frames: usize,
}

impl TunnelConfig {
    pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

    pub fn new(identity: ClientIdentity, target: TargetAddress) -> Self {
        Self {
            identity,
            target,
            reconnect_delay: Self::DEFAULT_RECONNECT_DELAY,
            handshake_timeout: Duration::from_secs(10),
            local_connect_timeout: Duration::from_secs(5),
            teardown_grace: Duration::from_secs(5),
            outbound_queue_frames: 64,
            session_buffer_frames: 256,
        }
    }

    /// Set the reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the local connect timeout
    pub fn with_local_connect_timeout(mut self, timeout: Duration) -> Self {
        self.local_connect_timeout = timeout;
        self
    }
}
