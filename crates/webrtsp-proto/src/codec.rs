//! Length-prefixed framing for proxy messages
//!
//! Frame layout: `[payload length: u32, big endian][bincode payload]`. The
//! decoder is incremental; feed it whatever chunks the transport produces
//! and it yields messages as soon as they are complete.

use crate::messages::ProxyMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const HEADER_LEN: usize = 4;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),
}

/// Proxy message codec
pub struct ProxyCodec;

impl ProxyCodec {
    /// Upper bound on a single frame's payload. Anything larger is a
    /// protocol violation, not a message.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Encode one message into a ready-to-send frame.
    pub fn encode(msg: &ProxyMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;
        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len(), Self::MAX_FRAME_SIZE));
        }

        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Pull the next complete message out of `buf`, consuming its bytes.
    ///
    /// `Ok(None)` means the buffer holds only a partial frame; collect more
    /// input and call again.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ProxyMessage>, CodecError> {
        let Some(payload_len) = Self::peek_len(buf)? else {
            return Ok(None);
        };
        if buf.len() < HEADER_LEN + payload_len {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(payload_len);
        Ok(Some(bincode::deserialize(&payload)?))
    }

    /// Drain every complete message currently buffered.
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<ProxyMessage>, CodecError> {
        let mut messages = Vec::new();
        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }
        Ok(messages)
    }

    /// Payload length from the frame header, without consuming it.
    fn peek_len(buf: &BytesMut) -> Result<Option<usize>, CodecError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if declared > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(declared, Self::MAX_FRAME_SIZE));
        }
        Ok(Some(declared))
    }
}
