//! Client error types.

use iproto_protocol::{GreetingError, ProtocolError, ServerError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("bad greeting: {0}")]
    BadGreeting(#[from] GreetingError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("request timeout")]
    Timeout,

    #[error("protocol usage error: {0}")]
    ProtocolUsage(&'static str),

    #[error("{0}")]
    Server(ServerError),

    #[error("no available clients in pool")]
    NoAvailableClients,

    #[error("no such connection group: {0}")]
    NoSuchGroup(String),

    #[error("index {index} out of range for group {tag} (size {size})")]
    IndexOutOfRange {
        tag: String,
        index: usize,
        size: usize,
    },

    #[error("pool is closed")]
    PoolClosed,

    #[error("schema fetching failed: {0}")]
    SchemaFetching(String),

    #[error("no schema for {0}")]
    NoSchema(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("encoding error: {0}")]
    Encode(String),
}

impl ClientError {
    pub(crate) fn closed(reason: &str) -> Self {
        ClientError::ConnectionClosed {
            reason: reason.to_string(),
        }
    }

    /// Returns whether retrying the operation on a fresh connection can help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout
                | ClientError::ConnectionClosed { .. }
                | ClientError::NotConnected
                | ClientError::NoAvailableClients
        )
    }

    /// Server error code, for errors reported by the server.
    pub fn server_code(&self) -> Option<u32> {
        match self {
            ClientError::Server(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<ServerError> for ClientError {
    fn from(e: ServerError) -> Self {
        ClientError::Server(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::closed("shutdown by server").is_retryable());
        assert!(!ClientError::ProtocolUsage("started twice").is_retryable());
        assert!(!ClientError::Protocol(ProtocolError::MissingField("sync")).is_retryable());
        assert!(!ClientError::Server(ServerError::new(3, "dup")).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ClientError::closed("closed unexpectedly");
        assert_eq!(err.to_string(), "connection closed: closed unexpectedly");

        let err = ClientError::IndexOutOfRange {
            tag: "node-1".into(),
            index: 1,
            size: 1,
        };
        assert!(err.to_string().contains("node-1"));

        let err = ClientError::Server(ServerError::new(3, "Duplicate key"));
        assert_eq!(err.server_code(), Some(3));
        assert_eq!(err.to_string(), "server error 3: Duplicate key");
    }
}
