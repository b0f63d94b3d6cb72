//! Protocol error types.

use thiserror::Error;

/// Framing and message-structure errors.
///
/// None of these are retryable: the bytes on the wire are wrong.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid length prefix: marker {0:#04x} is not an unsigned integer")]
    InvalidLength(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("unexpected end of data at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("reserved MessagePack marker {marker:#04x} at offset {offset}")]
    InvalidMarker { marker: u8, offset: usize },

    #[error("malformed {section}: {reason}")]
    MalformedMap {
        section: &'static str,
        reason: String,
    },

    #[error("field {key:#04x} has unexpected type: expected {expected}")]
    InvalidFieldType { key: u8, expected: &'static str },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("trailing {0} bytes after frame body")]
    TrailingBytes(usize),

    #[error("MessagePack encode error: {0}")]
    Encode(String),

    #[error("MessagePack decode error: {0}")]
    Decode(String),
}

impl From<rmpv::encode::Error> for ProtocolError {
    fn from(e: rmpv::encode::Error) -> Self {
        ProtocolError::Encode(e.to_string())
    }
}

impl From<rmpv::decode::Error> for ProtocolError {
    fn from(e: rmpv::decode::Error) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

/// Greeting validation failures, one per field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GreetingError {
    #[error("greeting is empty")]
    Empty,

    #[error("greeting too short: {len} bytes (need {need})")]
    TooShort { len: usize, need: usize },

    #[error("unrecognized greeting magic: {0:?}")]
    UnknownMagic(String),

    #[error("unrecognized protocol type: {0:?}")]
    UnknownProtocol(String),

    #[error("unparseable instance identifier: {0:?}")]
    InvalidInstanceId(String),

    #[error("invalid salt encoding")]
    InvalidSalt,
}
