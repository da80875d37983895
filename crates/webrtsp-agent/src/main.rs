//! WebRTSP inverse proxy agent CLI
//!
//! This binary runs the inverse proxy agent, which keeps an outbound
//! connection to a public broker and forwards broker-initiated sessions to
//! a WebRTSP signaling service on the local network.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use webrtsp_tunnel::{
    ClientIdentity, Supervisor, TargetAddress, TunnelConfig, WebSocketConfig, WebSocketConnector,
};

/// WebRTSP inverse proxy agent - exposes a private signaling service through a public broker
#[derive(Parser, Debug)]
#[command(name = "webrtsp-agent")]
#[command(
    about = "WebRTSP inverse proxy agent - exposes a private signaling service through a public broker"
)]
#[command(version)]
#[command(long_about = r#"
The agent connects out to a public inverse proxy broker, authenticates
with its name and token, and forwards every session the broker opens to
the WebRTSP signaling service running on the local network.

EXAMPLES:
  # Start agent with basic configuration
  webrtsp-agent --broker wss://broker.example.com/proxy \
    --name camera-porch --auth-token $TOKEN \
    --target-host 127.0.0.1 --target-port 5554

  # Start agent using config file
  webrtsp-agent --config agent-config.yaml

  # Start agent with custom log level
  webrtsp-agent --config agent-config.yaml --log-level debug

ENVIRONMENT VARIABLES:
  WEBRTSP_BROKER       Broker WebSocket URL (ws:// or wss://)
  WEBRTSP_NAME         Agent name registered with the broker
  WEBRTSP_AUTH_TOKEN   Authentication token
  WEBRTSP_TARGET_HOST  Signaling service host
  WEBRTSP_TARGET_PORT  Signaling service port
"#)]
struct Args {
    /// Broker WebSocket URL (e.g., wss://broker.example.com/proxy)
    #[arg(long, env = "WEBRTSP_BROKER")]
    broker: Option<String>,

    /// Agent name registered with the broker
    #[arg(long, env = "WEBRTSP_NAME")]
    name: Option<String>,

    /// Authentication token
    #[arg(long, env = "WEBRTSP_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Signaling service host to forward sessions to
    #[arg(long, env = "WEBRTSP_TARGET_HOST")]
    target_host: Option<String>,

    /// Signaling service port to forward sessions to
    #[arg(long, env = "WEBRTSP_TARGET_PORT")]
    target_port: Option<u16>,

    /// Seconds to wait between reconnect attempts
    #[arg(long)]
    reconnect_timeout: Option<u64>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    /// Broker configuration
    #[serde(default)]
    broker: BrokerSection,

    /// Authentication configuration
    #[serde(default)]
    auth: AuthSection,

    /// Signaling service configuration
    #[serde(default)]
    target: TargetSection,

    /// Diagnostics configuration
    #[serde(default)]
    debug: DebugSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BrokerSection {
    /// Broker WebSocket URL
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthSection {
    /// Agent name
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    /// Environment variable name for the auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    token_env: Option<String>,

    /// Direct auth token (prefer using token_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TargetSection {
    /// Signaling service host
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,

    /// Signaling service port
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,

    /// Seconds to wait between reconnect attempts
    #[serde(rename = "reconnect-timeout", skip_serializing_if = "Option::is_none")]
    reconnect_timeout: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DebugSection {
    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Fully resolved agent configuration
#[derive(Debug)]
struct AgentSetup {
    tunnel: TunnelConfig,
    websocket: WebSocketConfig,
    log_level: String,
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_config(args: Args) -> Result<AgentSetup> {
    let file = if let Some(config_path) = &args.config {
        load_config_file(config_path)?
    } else {
        ConfigFile::default()
    };

    // Token may come from the file directly or through a named env var
    let file_token = if let Some(env_var) = &file.auth.token_env {
        Some(
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
        )
    } else {
        file.auth.token
    };

    let broker_url = args
        .broker
        .or(file.broker.url)
        .context("Missing broker URL (use --broker or config file)")?;
    let name = args
        .name
        .or(file.auth.name)
        .context("Missing authentication name (use --name or config file)")?;
    let auth_token = args
        .auth_token
        .or(file_token)
        .context("Missing authentication token (use --auth-token or config file)")?;
    let target_host = args
        .target_host
        .or(file.target.host)
        .context("Missing target host (use --target-host or config file)")?;
    let target_port = args
        .target_port
        .or(file.target.port)
        .context("Missing target port (use --target-port or config file)")?;

    validate_broker_url(&broker_url)?;

    if name.is_empty() {
        anyhow::bail!("Authentication name cannot be empty");
    }
    if target_host.is_empty() {
        anyhow::bail!("Target host cannot be empty");
    }
    if target_port == 0 {
        anyhow::bail!("Target port cannot be 0");
    }

    let mut config = TunnelConfig::new(
        ClientIdentity { name, auth_token },
        TargetAddress::new(target_host, target_port),
    );

    if let Some(secs) = args.reconnect_timeout.or(file.target.reconnect_timeout) {
        config = config.with_reconnect_delay(Duration::from_secs(secs));
    }

    let log_level = args
        .log_level
        .or(file.debug.log_level)
        .unwrap_or_else(|| "info".to_string());

    Ok(AgentSetup {
        tunnel: config,
        websocket: WebSocketConfig::new(broker_url),
        log_level,
    })
}

/// Validate broker URL scheme (ws:// or wss://)
fn validate_broker_url(url: &str) -> Result<()> {
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        anyhow::bail!(
            "Invalid broker URL: '{}' (expected a ws:// or wss:// URL)",
            url
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.clone();

    // Resolve the whole configuration first; the file may set the log level.
    let setup = build_config(args).context("Failed to build agent configuration")?;
    setup_logging(&setup.log_level)?;

    info!("WebRTSP agent starting...");
    if let Some(path) = &config_path {
        info!("Loaded configuration from: {}", path.display());
    }

    // Log configuration (but not the auth token)
    let AgentSetup {
        tunnel: config,
        websocket: ws_config,
        ..
    } = setup;
    info!("Agent name: {}", config.identity.name);
    info!("Broker: {}", ws_config.url);
    info!("Target: {}", config.target);

    let connector = WebSocketConnector::new(ws_config);
    let supervisor = Supervisor::new(Arc::new(config), Box::new(connector));
    let shutdown = supervisor.shutdown_handle();

    let supervisor_task = tokio::spawn(supervisor.run());

    // Wait for Ctrl+C, then let the supervisor wind down
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }

    shutdown.shutdown();

    if let Err(e) = supervisor_task.await {
        error!("Supervisor task panicked: {}", e);
        return Err(e.into());
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            broker: Some("wss://broker.example.com/proxy".to_string()),
            name: Some("camera-porch".to_string()),
            auth_token: Some("secret".to_string()),
            target_host: Some("127.0.0.1".to_string()),
            target_port: Some(5554),
            reconnect_timeout: None,
            config: None,
            log_level: None,
        }
    }

    #[test]
    fn test_validate_broker_url() {
        assert!(validate_broker_url("ws://localhost:8080/proxy").is_ok());
        assert!(validate_broker_url("wss://broker.example.com/proxy").is_ok());

        assert!(validate_broker_url("http://broker.example.com").is_err());
        assert!(validate_broker_url("broker.example.com:8080").is_err());
        assert!(validate_broker_url("").is_err());
    }

    #[test]
    fn test_build_config_from_args() {
        let setup = build_config(base_args()).unwrap();
        assert_eq!(setup.tunnel.identity.name, "camera-porch");
        assert_eq!(setup.tunnel.target.host, "127.0.0.1");
        assert_eq!(setup.tunnel.target.port, 5554);
        assert_eq!(setup.websocket.url, "wss://broker.example.com/proxy");
        assert_eq!(setup.log_level, "info");
    }

    #[test]
    fn test_config_file_format() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
broker:
  url: wss://broker.example.com/proxy
auth:
  name: camera-porch
  token: secret
target:
  host: 127.0.0.1
  port: 5554
  reconnect-timeout: 10
debug:
  log-level: debug
"#,
        )
        .unwrap();

        assert_eq!(
            file.broker.url.as_deref(),
            Some("wss://broker.example.com/proxy")
        );
        assert_eq!(file.auth.name.as_deref(), Some("camera-porch"));
        assert_eq!(file.target.port, Some(5554));
        assert_eq!(file.target.reconnect_timeout, Some(10));
        assert_eq!(file.debug.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_build_config_requires_name() {
        let mut args = base_args();
        args.name = None;
        let err = build_config(args).unwrap_err();
        assert!(err.to_string().contains("Missing authentication name"));
    }

    #[test]
    fn test_build_config_requires_target() {
        let mut args = base_args();
        args.target_host = None;
        assert!(build_config(args).is_err());

        let mut args = base_args();
        args.target_port = None;
        assert!(build_config(args).is_err());
    }

    #[test]
    fn test_reconnect_timeout_override() {
        let mut args = base_args();
        args.reconnect_timeout = Some(30);
        let setup = build_config(args).unwrap();
        assert_eq!(setup.tunnel.reconnect_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_reconnect_timeout_means_immediate_retry() {
        let mut args = base_args();
        args.reconnect_timeout = Some(0);
        let setup = build_config(args).unwrap();
        assert_eq!(setup.tunnel.reconnect_delay, Duration::ZERO);
    }
}
