//! # iproto-protocol
//!
//! Wire protocol implementation for IProto, the binary request/response
//! protocol spoken by Tarantool-compatible servers.
//!
//! This crate provides:
//! - Length-prefixed framing with MessagePack header and body maps
//! - Request builders for every request kind
//! - Read-only responses with lazy, zero-copy body field access
//! - Structured server error stacks
//! - Greeting parsing and authentication scrambles

pub mod auth;
pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod greeting;
pub mod message;
pub mod msgpack;
pub mod request;
pub mod server_error;

pub use auth::AuthMechanism;
pub use codec::{Decoder, Encoder};
pub use constants::{IteratorType, RequestType, TransactionIsolation};
pub use error::{GreetingError, ProtocolError};
pub use frame::Frame;
pub use greeting::Greeting;
pub use message::{Header, Request, Response};
pub use server_error::{ErrorEntry, ServerError};

/// Highest IProto protocol version this implementation speaks in the ID exchange.
pub const PROTOCOL_VERSION: u64 = 3;

/// Default port for IProto servers.
pub const DEFAULT_PORT: u16 = 3301;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
