//! Connection supervisor
//!
//! Owns the reconnect-forever loop: connect, authenticate, hand the
//! transport to a fresh multiplexer generation, and on any disconnect wait
//! out the fixed delay before trying again. Only an explicit shutdown ends
//! the loop.

use crate::config::TunnelConfig;
use crate::handshake::{self, HandshakeError};
use crate::multiplexer::{Disconnect, Multiplexer};
use crate::session::Generation;
use crate::transport::TransportConnector;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a connection attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Could not reach the broker
    ConnectFailed,
    /// Broker rejected the credentials
    AuthFailed,
    /// Connection established, then lost
    TransportLost,
    /// Broker closed the connection cleanly
    RemoteClosed,
    /// Local shutdown request
    Shutdown,
}

/// Fixed reconnect delay with cancellation.
///
/// Every disconnect waits the same configured interval; there is no
/// backoff, the broker is the agent's own infrastructure and a steady
/// retry cadence is what operators expect to see.
struct ReconnectDelay {
    delay: Duration,
    attempt: u64,
}

impl ReconnectDelay {
    fn new(delay: Duration) -> Self {
        Self { delay, attempt: 0 }
    }

    fn attempt(&self) -> u64 {
        self.attempt
    }

    fn next_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.attempt
    }

    /// Wait the full delay. Returns false when cancelled mid-wait.
    async fn wait(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.delay) => true,
        }
    }
}

/// Handle for requesting supervisor shutdown from another task
#[derive(Clone)]
pub struct ShutdownHandle {
    cancel: CancellationToken,
}

impl ShutdownHandle {
    /// Idempotent; safe to call from signal handlers more than once.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Drives the reconnect loop over a pluggable transport
pub struct Supervisor {
    config: Arc<TunnelConfig>,
    connector: Box<dyn TransportConnector>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(config: Arc<TunnelConfig>, connector: Box<dyn TransportConnector>) -> Self {
        Self {
            config,
            connector,
            cancel: CancellationToken::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Run until shutdown. Never returns an error; every failure is logged
    /// and retried after the configured delay.
    pub async fn run(self) {
        let mut delay = ReconnectDelay::new(self.config.reconnect_delay);

        info!(
            name = %self.config.identity.name,
            target = %self.config.target,
            "agent starting"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let generation = delay.next_attempt();
            match self.run_generation(generation).await {
                AttemptOutcome::Shutdown => break,
                outcome => {
                    info!(
                        generation,
                        outcome = ?outcome,
                        delay_secs = self.config.reconnect_delay.as_secs_f64(),
                        "disconnected, waiting before reconnect"
                    );
                }
            }

            if !delay.wait(&self.cancel).await {
                break;
            }
        }

        info!(attempts = delay.attempt(), "agent stopped");
    }

    /// One full connection generation: connect, authenticate, multiplex.
    async fn run_generation(&self, generation: Generation) -> AttemptOutcome {
        debug!(generation, "connecting to broker");

        let transport = tokio::select! {
            _ = self.cancel.cancelled() => return AttemptOutcome::Shutdown,
            res = self.connector.connect() => match res {
                Ok(transport) => transport,
                Err(e) => {
                    warn!(generation, error = %e, "broker connect failed");
                    return AttemptOutcome::ConnectFailed;
                }
            },
        };

        let (mut sink, mut source) = transport.split();

        let authenticated = tokio::select! {
            _ = self.cancel.cancelled() => return AttemptOutcome::Shutdown,
            res = handshake::authenticate(
                sink.as_mut(),
                source.as_mut(),
                &self.config.identity,
                self.config.handshake_timeout,
            ) => res,
        };

        let carryover = match authenticated {
            Ok(carryover) => carryover,
            Err(e) => {
                let _ = sink.close().await;
                return match e {
                    HandshakeError::Rejected(reason) => {
                        error!(generation, %reason, "broker rejected credentials");
                        AttemptOutcome::AuthFailed
                    }
                    other => {
                        warn!(generation, error = %other, "handshake failed");
                        AttemptOutcome::ConnectFailed
                    }
                };
            }
        };

        info!(generation, name = %self.config.identity.name, "authenticated with broker");

        // Everything spawned for this generation hangs off this child token,
        // so teardown cannot leak sessions into the next generation.
        let generation_cancel = self.cancel.child_token();
        let mux = Multiplexer::new(generation, self.config.clone(), generation_cancel);

        match mux.run(sink, source, carryover).await {
            Disconnect::Shutdown => {
                if self.cancel.is_cancelled() {
                    AttemptOutcome::Shutdown
                } else {
                    AttemptOutcome::TransportLost
                }
            }
            Disconnect::RemoteClosed => AttemptOutcome::RemoteClosed,
            Disconnect::Failed(e) => {
                warn!(generation, error = %e, "connection lost");
                AttemptOutcome::TransportLost
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delay_waits_full_interval() {
        let delay = ReconnectDelay::new(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        assert!(delay.wait(&cancel).await);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delay_cancelled_mid_wait() {
        let delay = ReconnectDelay::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn({
            let cancel = cancel.clone();
            async move { delay.wait(&cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_attempt_counter_increments() {
        let mut delay = ReconnectDelay::new(Duration::from_secs(5));
        assert_eq!(delay.attempt(), 0);
        assert_eq!(delay.next_attempt(), 1);
        assert_eq!(delay.next_attempt(), 2);
        assert_eq!(delay.attempt(), 2);
    }
}
