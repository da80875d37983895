//! Tunnel engine for the WebRTSP inverse proxy client.
//!
//! The client lives next to a local RTSP/WebRTC signaling service and keeps a
//! single outbound connection to a public broker. The broker multiplexes the
//! connections of its own clients over that link as numbered sessions; for
//! each session this crate opens a fresh connection to the local service and
//! relays bytes both ways until either side closes.
//!
//! Component map:
//!
//! - [`transport`]: the framed message channel to the broker, with a
//!   WebSocket production implementation ([`websocket`]) and an in-memory one
//!   for tests ([`memory`]).
//! - [`handshake`]: the one-shot name/token exchange that gates all traffic.
//! - [`multiplexer`]: routes broker frames to sessions and serializes all
//!   outgoing frames through a single writer.
//! - [`connector`] / [`relay`]: per-session local connect and byte pump.
//! - [`supervisor`]: owns the connect/authenticate/run/reconnect loop.

pub mod config;
pub mod connector;
pub mod handshake;
pub mod memory;
pub mod multiplexer;
pub mod relay;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod websocket;

pub use config::{ClientIdentity, TargetAddress, TunnelConfig};
pub use supervisor::{ShutdownHandle, Supervisor};
pub use transport::{Transport, TransportConnector, TransportError};
pub use websocket::{WebSocketConfig, WebSocketConnector};
