//! Request and response message types.
//!
//! A message is a header map followed by a body map, both keyed by small
//! integers. Requests own their fields until they are encoded; responses are
//! read-only views over the received frame.

use crate::constants::{body_key, header_key, RequestType, TYPE_ERROR};
use crate::error::ProtocolError;
use crate::frame::{Frame, LENGTH_PREFIX_SIZE};
use crate::msgpack;
use crate::server_error::ServerError;
use crate::MAX_FRAME_SIZE;
use bytes::Bytes;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

fn encode_err(e: impl fmt::Display) -> ProtocolError {
    ProtocolError::Encode(e.to_string())
}

/// A single map value, either structured or already MessagePack-encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    Raw(Bytes),
}

impl FieldValue {
    fn write(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            FieldValue::Value(value) => rmpv::encode::write_value(buf, value).map_err(encode_err),
            FieldValue::Raw(raw) => {
                buf.extend_from_slice(raw);
                Ok(())
            }
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Value(value)
    }
}

/// Encodes a header map and body map into a length-prefixed frame.
pub fn encode_message(
    header: &[(u8, FieldValue)],
    body: &[(u8, FieldValue)],
) -> Result<Bytes, ProtocolError> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&[0xce, 0, 0, 0, 0]);

    for map in [header, body] {
        rmp::encode::write_map_len(&mut buf, map.len() as u32).map_err(encode_err)?;
        for (key, value) in map {
            rmp::encode::write_uint(&mut buf, *key as u64).map_err(encode_err)?;
            value.write(&mut buf)?;
        }
    }

    let len = (buf.len() - LENGTH_PREFIX_SIZE) as u64;
    if len > MAX_FRAME_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    buf[1..LENGTH_PREFIX_SIZE].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(Bytes::from(buf))
}

/// An outgoing request. Mutable until it is sent; the sync is assigned by
/// the connection at send time.
#[derive(Debug, Clone)]
pub struct Request {
    request_type: RequestType,
    sync: Option<u64>,
    stream_id: Option<u64>,
    body: Vec<(u8, FieldValue)>,
}

impl Request {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            sync: None,
            stream_id: None,
            body: Vec::new(),
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn sync(&self) -> Option<u64> {
        self.sync
    }

    pub fn set_sync(&mut self, sync: u64) {
        self.sync = Some(sync);
    }

    pub fn with_sync(mut self, sync: u64) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn stream_id(&self) -> Option<u64> {
        self.stream_id
    }

    pub fn set_stream_id(&mut self, stream_id: Option<u64>) {
        self.stream_id = stream_id;
    }

    /// Places the request in a server-side transaction stream.
    pub fn with_stream_id(mut self, stream_id: u64) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// Sets a body field, replacing any previous value for the key.
    pub fn set_field(&mut self, key: u8, value: impl Into<FieldValue>) {
        let value = value.into();
        match self.body.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.body.push((key, value)),
        }
    }

    pub fn with_field(mut self, key: u8, value: impl Into<Value>) -> Self {
        self.set_field(key, FieldValue::Value(value.into()));
        self
    }

    /// Sets a body field from bytes that are already MessagePack-encoded.
    pub fn with_raw_field(mut self, key: u8, raw: Bytes) -> Self {
        self.set_field(key, FieldValue::Raw(raw));
        self
    }

    /// Sets a body field by serializing `value` with serde.
    pub fn with_serialized<T: Serialize + ?Sized>(
        mut self,
        key: u8,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let raw = rmp_serde::to_vec(value)?;
        self.set_field(key, FieldValue::Raw(Bytes::from(raw)));
        Ok(self)
    }

    pub fn field(&self, key: u8) -> Option<&FieldValue> {
        self.body.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn body(&self) -> &[(u8, FieldValue)] {
        &self.body
    }

    /// Encodes the request into a frame. Deterministic for a given sync.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let sync = self.sync.ok_or(ProtocolError::MissingField("sync"))?;
        let mut header = vec![
            (
                header_key::REQUEST_TYPE,
                FieldValue::Value(Value::from(self.request_type.code())),
            ),
            (header_key::SYNC, FieldValue::Value(Value::from(sync))),
        ];
        if let Some(stream_id) = self.stream_id {
            header.push((header_key::STREAM_ID, FieldValue::Value(Value::from(stream_id))));
        }
        encode_message(&header, &self.body)
    }
}

/// Response header, decoded eagerly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Raw request type code; error responses carry `TYPE_ERROR | code`.
    pub code: u32,
    pub sync: Option<u64>,
    pub schema_version: Option<u64>,
    pub stream_id: Option<u64>,
}

impl Header {
    fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let (entries, end) = msgpack::index_int_map(buf, 0, "header")?;
        let mut header = Header::default();
        let mut saw_type = false;

        for (key, start, _) in entries {
            let field = |name: &'static str| {
                msgpack::read_u64(buf, start)
                    .map(|(v, _)| v)
                    .map_err(|_| ProtocolError::InvalidFieldType {
                        key,
                        expected: name,
                    })
            };
            match key {
                header_key::REQUEST_TYPE => {
                    let code = field("unsigned integer")?;
                    header.code = u32::try_from(code).map_err(|_| {
                        ProtocolError::InvalidFieldType {
                            key,
                            expected: "32-bit request type",
                        }
                    })?;
                    saw_type = true;
                }
                header_key::SYNC => header.sync = Some(field("unsigned integer")?),
                header_key::SCHEMA_VERSION => {
                    header.schema_version = Some(field("unsigned integer")?)
                }
                header_key::STREAM_ID => header.stream_id = Some(field("unsigned integer")?),
                _ => {}
            }
        }

        if !saw_type {
            return Err(ProtocolError::MissingField("request type"));
        }
        Ok((header, end))
    }

    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::from_code(self.code)
    }

    pub fn is_error(&self) -> bool {
        self.code >= TYPE_ERROR
    }

    /// Server error code, if this is an error response.
    pub fn error_code(&self) -> Option<u32> {
        self.is_error().then_some(self.code & (TYPE_ERROR - 1))
    }

    /// Out-of-band push tied to a pending request.
    pub fn is_push(&self) -> bool {
        self.code == RequestType::Chunk.code()
    }

    /// Watcher notification; carries no sync.
    pub fn is_event(&self) -> bool {
        self.code == RequestType::Event.code()
    }
}

/// A received message: the frame buffer plus its decoded header.
///
/// Body fields are located on demand by skipping over encoded values, so
/// reading one field never decodes the others.
#[derive(Clone)]
pub struct Response {
    frame: Bytes,
    header: Header,
    body_offset: usize,
}

impl Response {
    /// Parses a frame payload. Only the header is decoded; the body must be
    /// a map (or absent) and is walked once to check it ends exactly at the
    /// frame boundary, without decoding any value.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let buf = frame.payload;
        let (header, body_offset) = Header::decode(&buf)?;

        if body_offset < buf.len() {
            msgpack::read_map_len(&buf, body_offset).map_err(|_| {
                ProtocolError::MalformedMap {
                    section: "body",
                    reason: "not a map".to_string(),
                }
            })?;
            let end = msgpack::skip_value(&buf, body_offset)?;
            if end != buf.len() {
                return Err(ProtocolError::TrailingBytes(buf.len() - end));
            }
        }

        Ok(Self {
            frame: buf,
            header,
            body_offset,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn sync(&self) -> Option<u64> {
        self.header.sync
    }

    pub fn schema_version(&self) -> Option<u64> {
        self.header.schema_version
    }

    pub fn request_type(&self) -> Option<RequestType> {
        self.header.request_type()
    }

    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    pub fn error_code(&self) -> Option<u32> {
        self.header.error_code()
    }

    pub fn is_push(&self) -> bool {
        self.header.is_push()
    }

    pub fn is_event(&self) -> bool {
        self.header.is_event()
    }

    /// Raw encoded body map.
    pub fn body(&self) -> &[u8] {
        &self.frame[self.body_offset..]
    }

    fn locate(&self, key: u8) -> Result<Option<(usize, usize)>, ProtocolError> {
        let body = self.body();
        if body.is_empty() {
            return Ok(None);
        }
        let (len, mut pos) = msgpack::read_map_len(body, 0)?;
        for _ in 0..len {
            let (k, value_start) =
                msgpack::read_u64(body, pos).map_err(|_| ProtocolError::MalformedMap {
                    section: "body",
                    reason: format!("non-integer key at offset {pos}"),
                })?;
            let value_end = msgpack::skip_value(body, value_start)?;
            if k == key as u64 {
                return Ok(Some((value_start, value_end)));
            }
            pos = value_end;
        }
        Ok(None)
    }

    /// Encoded bytes of one body field, borrowed from the frame.
    pub fn raw_field(&self, key: u8) -> Result<Option<&[u8]>, ProtocolError> {
        Ok(self
            .locate(key)?
            .map(|(start, end)| &self.body()[start..end]))
    }

    /// Encoded bytes of one body field as a shared slice of the frame.
    pub fn field_bytes(&self, key: u8) -> Result<Option<Bytes>, ProtocolError> {
        Ok(self.locate(key)?.map(|(start, end)| {
            self.frame
                .slice(self.body_offset + start..self.body_offset + end)
        }))
    }

    /// Decodes one body field into a MessagePack value tree.
    pub fn field(&self, key: u8) -> Result<Option<Value>, ProtocolError> {
        match self.raw_field(key)? {
            Some(mut raw) => Ok(Some(rmpv::decode::read_value(&mut raw)?)),
            None => Ok(None),
        }
    }

    /// Deserializes one body field with serde.
    pub fn decode_field<T: DeserializeOwned>(&self, key: u8) -> Result<Option<T>, ProtocolError> {
        match self.raw_field(key)? {
            Some(raw) => Ok(Some(rmp_serde::from_slice(raw)?)),
            None => Ok(None),
        }
    }

    /// Encoded `DATA` field, the payload of most successful responses.
    pub fn data(&self) -> Result<Option<&[u8]>, ProtocolError> {
        self.raw_field(body_key::DATA)
    }

    /// Keys present in the body, in wire order.
    pub fn body_keys(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = self.body();
        if body.is_empty() {
            return Ok(Vec::new());
        }
        let (entries, end) = msgpack::index_int_map(body, 0, "body")?;
        if end != body.len() {
            return Err(ProtocolError::TrailingBytes(body.len() - end));
        }
        Ok(entries.into_iter().map(|(k, _, _)| k).collect())
    }

    /// Decodes the structured server error, if this is an error response.
    pub fn server_error(&self) -> Option<ServerError> {
        let code = self.error_code()?;
        Some(ServerError::from_response(code, self))
    }

    /// Watch key of an `EVENT` message.
    pub fn event_key(&self) -> Option<String> {
        match self.field(body_key::EVENT_KEY) {
            Ok(Some(Value::String(s))) => s.into_str(),
            _ => None,
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("header", &self.header)
            .field("body_len", &self.body().len())
            .finish()
    }
}
