//! Wire protocol between the inverse proxy client and its broker.
//!
//! The protocol is a private contract: every message is bincode serialized
//! and framed with a length prefix so it can travel over any ordered message
//! transport. Payload bytes round-trip exactly; nothing is transcoded.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ProxyCodec};
pub use messages::{ProxyMessage, SessionId};
