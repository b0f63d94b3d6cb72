//! Length-prefixed frame format.
//!
//! ```text
//! +----------------------+-------------+-----------+
//! | length (msgpack uint)| header map  | body map  |
//! | 1..9 bytes           | length bytes, together  |
//! +----------------------+-------------------------+
//! ```
//!
//! The encoder always writes the length as `0xce` followed by a big-endian
//! u32, which is what servers send as well. The decoder accepts any
//! MessagePack unsigned integer encoding.

use crate::error::ProtocolError;
use crate::msgpack;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix written by the encoder.
pub const LENGTH_PREFIX_SIZE: usize = 5;

/// A complete frame: the header and body maps without the length prefix.
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Encodes the frame with its length prefix.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let len = self.payload.len() as u64;
        if len > MAX_FRAME_SIZE as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + self.payload.len());
        buf.put_u8(0xce);
        buf.put_u32(len as u32);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on a malformed prefix.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some((len, prefix)) = msgpack::peek_length(&buf[..])? else {
            return Ok(None);
        };

        if len > MAX_FRAME_SIZE as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if len == 0 {
            return Err(ProtocolError::MissingField("header"));
        }

        let total = prefix + len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(prefix);
        let payload = buf.split_to(len as usize).freeze();
        Ok(Some(Self { payload }))
    }
}
