//! Encoder and decoder for IProto frames and messages.

use crate::constants::header_key;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{encode_message, FieldValue, Request, Response};
use bytes::{Bytes, BytesMut};
use rmpv::Value;

/// Encodes requests and responses into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a request into a frame. The request must carry a sync.
    pub fn encode_request(request: &Request) -> Result<Bytes, ProtocolError> {
        request.encode()
    }

    /// Encodes a response the way a server does: request type, optional
    /// sync and the schema version in the header.
    pub fn encode_response(
        code: u32,
        sync: Option<u64>,
        schema_version: u64,
        body: Vec<(u8, Value)>,
    ) -> Result<Bytes, ProtocolError> {
        let mut header = vec![(header_key::REQUEST_TYPE, FieldValue::Value(Value::from(code)))];
        if let Some(sync) = sync {
            header.push((header_key::SYNC, FieldValue::Value(Value::from(sync))));
        }
        header.push((
            header_key::SCHEMA_VERSION,
            FieldValue::Value(Value::from(schema_version)),
        ));
        let body: Vec<_> = body
            .into_iter()
            .map(|(k, v)| (k, FieldValue::Value(v)))
            .collect();
        encode_message(&header, &body)
    }
}

/// Decodes frames into responses.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next response from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(Response::from_frame(frame)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
