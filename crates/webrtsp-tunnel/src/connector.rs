//! Local TCP connector
//!
//! Opens one outbound connection to the configured local service per
//! session, under a bounded timeout. Attempts for distinct sessions run in
//! their own tasks, so a hung target never blocks other sessions.

use crate::config::TargetAddress;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Errors from one local connect attempt
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to {address}")]
    Timeout { address: String },
}

/// Connects sessions to the local target service
pub struct LocalConnector {
    target: TargetAddress,
    timeout: Duration,
}

impl LocalConnector {
    pub fn new(target: TargetAddress, timeout: Duration) -> Self {
        Self { target, timeout }
    }

    pub async fn connect(&self) -> Result<TcpStream, ConnectError> {
        let address = self.target.to_string();

        match tokio::time::timeout(self.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectError::ConnectionFailed { address, source }),
            Err(_) => Err(ConnectError::Timeout { address }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = LocalConnector::new(
            TargetAddress::new("127.0.0.1", port),
            Duration::from_secs(1),
        );
        let result = connector.connect().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = LocalConnector::new(
            TargetAddress::new("127.0.0.1", port),
            Duration::from_secs(1),
        );
        let result = connector.connect().await;
        assert!(matches!(result, Err(ConnectError::ConnectionFailed { .. })));
    }

    #[test]
    fn test_error_carries_address() {
        let err = ConnectError::Timeout {
            address: "127.0.0.1:8554".to_string(),
        };
        assert!(err.to_string().contains("127.0.0.1:8554"));
    }
}
