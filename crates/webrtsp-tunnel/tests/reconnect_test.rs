//! Supervisor reconnect-loop integration tests
//!
//! Runs the full supervisor against scripted in-memory transports with
//! paused time, so delay assertions are exact and instant.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use webrtsp_proto::ProxyMessage;
use webrtsp_tunnel::memory::{self, BrokerEnd, MemoryConnector};
use webrtsp_tunnel::{ClientIdentity, Supervisor, TargetAddress, TunnelConfig};

fn config(reconnect_delay: Duration) -> Arc<TunnelConfig> {
    Arc::new(
        TunnelConfig::new(
            ClientIdentity {
                name: "camera-1".to_string(),
                auth_token: "secret".to_string(),
            },
            // Sessions are never opened in these tests.
            TargetAddress::new("127.0.0.1", 1),
        )
        .with_reconnect_delay(reconnect_delay)
        .with_handshake_timeout(Duration::from_secs(2)),
    )
}

async fn accept_handshake(broker: &mut BrokerEnd) {
    let request = broker.recv().await.expect("no handshake request");
    assert!(matches!(request, ProxyMessage::AuthRequest { .. }));
    broker.send(&ProxyMessage::AuthAccepted).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_remote_close() {
    let (t1, mut b1) = memory::pair(8);
    let (t2, mut b2) = memory::pair(8);
    let connector = MemoryConnector::new(vec![t1, t2]);

    let supervisor = Supervisor::new(config(Duration::from_secs(5)), Box::new(connector));
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());

    accept_handshake(&mut b1).await;

    // Broker goes away; the client must come back, but not before the
    // full delay has passed.
    let disconnected_at = Instant::now();
    drop(b1);

    accept_handshake(&mut b2).await;
    assert!(disconnected_at.elapsed() >= Duration::from_secs(5));

    // Second connection is fully live.
    b2.send(&ProxyMessage::Ping { timestamp: 9 }).await.unwrap();
    assert_eq!(
        b2.recv().await,
        Some(ProxyMessage::Pong { timestamp: 9 })
    );

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("supervisor did not stop")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_is_retried() {
    let (t1, mut b1) = memory::pair(8);
    let (t2, mut b2) = memory::pair(8);
    let connector = MemoryConnector::new(vec![t1, t2]);

    let supervisor = Supervisor::new(config(Duration::from_secs(5)), Box::new(connector));
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());

    let request = b1.recv().await.expect("no handshake request");
    assert!(matches!(request, ProxyMessage::AuthRequest { .. }));
    b1.send(&ProxyMessage::AuthRejected {
        reason: "unknown client".to_string(),
    })
    .await
    .unwrap();

    // Credential problems are not fatal; the client keeps its cadence and
    // presents again.
    accept_handshake(&mut b2).await;

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("supervisor did not stop")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_failures_keep_retrying() {
    // No transports at all: every connect attempt fails.
    let connector = MemoryConnector::new(vec![]);

    let supervisor = Supervisor::new(config(Duration::from_secs(60)), Box::new(connector));
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());

    // Let a few attempt/delay cycles pass, then stop mid-wait.
    tokio::time::sleep(Duration::from_secs(200)).await;
    shutdown.shutdown();

    tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("supervisor did not stop")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_idempotent() {
    let (t1, mut b1) = memory::pair(8);
    let connector = MemoryConnector::new(vec![t1]);

    let supervisor = Supervisor::new(config(Duration::from_secs(5)), Box::new(connector));
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());

    accept_handshake(&mut b1).await;

    shutdown.shutdown();
    shutdown.shutdown();
    shutdown.clone().shutdown();

    tokio::time::timeout(Duration::from_secs(30), run)
        .await
        .expect("supervisor did not stop")
        .unwrap();
}
