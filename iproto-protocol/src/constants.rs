//! Protocol constants: request type codes, map keys, iterators.
//!
//! These values are part of the wire contract and must match the server
//! bit for bit.

use std::fmt;

/// Request type codes at or above this value denote a server error.
pub const TYPE_ERROR: u32 = 0x8000;

/// Header map keys.
pub mod header_key {
    pub const REQUEST_TYPE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_VERSION: u8 = 0x05;
    pub const STREAM_ID: u8 = 0x0a;
}

/// Body map keys.
pub mod body_key {
    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const INDEX_BASE: u8 = 0x15;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPR: u8 = 0x27;
    pub const OPS: u8 = 0x28;
    pub const DATA: u8 = 0x30;
    pub const ERROR_24: u8 = 0x31;
    pub const METADATA: u8 = 0x32;
    pub const BIND_METADATA: u8 = 0x33;
    pub const SQL_TEXT: u8 = 0x40;
    pub const SQL_BIND: u8 = 0x41;
    pub const SQL_INFO: u8 = 0x42;
    pub const STMT_ID: u8 = 0x43;
    pub const ERROR: u8 = 0x52;
    pub const VERSION: u8 = 0x54;
    pub const FEATURES: u8 = 0x55;
    pub const TIMEOUT: u8 = 0x56;
    pub const EVENT_KEY: u8 = 0x57;
    pub const EVENT_DATA: u8 = 0x58;
    pub const TXN_ISOLATION: u8 = 0x59;
}

/// Keys inside the structured error stack (`body_key::ERROR`).
pub mod error_key {
    pub const STACK: u8 = 0x00;
    pub const TYPE: u8 = 0x00;
    pub const FILE: u8 = 0x01;
    pub const LINE: u8 = 0x02;
    pub const MESSAGE: u8 = 0x03;
    pub const ERRNO: u8 = 0x04;
    pub const CODE: u8 = 0x05;
    pub const FIELDS: u8 = 0x06;
}

/// Feature identifiers exchanged in the ID request.
pub mod feature {
    pub const STREAMS: u64 = 0;
    pub const TRANSACTIONS: u64 = 1;
    pub const ERROR_EXTENSION: u64 = 2;
    pub const WATCHERS: u64 = 3;
}

/// IProto request and response types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Ok,
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Auth,
    Eval,
    Upsert,
    Call,
    Execute,
    Nop,
    Prepare,
    Begin,
    Commit,
    Rollback,
    Ping,
    Id,
    Watch,
    Unwatch,
    Event,
    Chunk,
}

impl RequestType {
    /// Returns the wire code of this request type.
    pub fn code(self) -> u32 {
        match self {
            RequestType::Ok => 0,
            RequestType::Select => 1,
            RequestType::Insert => 2,
            RequestType::Replace => 3,
            RequestType::Update => 4,
            RequestType::Delete => 5,
            RequestType::Auth => 7,
            RequestType::Eval => 8,
            RequestType::Upsert => 9,
            RequestType::Call => 10,
            RequestType::Execute => 11,
            RequestType::Nop => 12,
            RequestType::Prepare => 13,
            RequestType::Begin => 14,
            RequestType::Commit => 15,
            RequestType::Rollback => 16,
            RequestType::Ping => 64,
            RequestType::Id => 73,
            RequestType::Watch => 74,
            RequestType::Unwatch => 75,
            RequestType::Event => 76,
            RequestType::Chunk => 128,
        }
    }

    /// Maps a wire code back to a request type.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => RequestType::Ok,
            1 => RequestType::Select,
            2 => RequestType::Insert,
            3 => RequestType::Replace,
            4 => RequestType::Update,
            5 => RequestType::Delete,
            7 => RequestType::Auth,
            8 => RequestType::Eval,
            9 => RequestType::Upsert,
            10 => RequestType::Call,
            11 => RequestType::Execute,
            12 => RequestType::Nop,
            13 => RequestType::Prepare,
            14 => RequestType::Begin,
            15 => RequestType::Commit,
            16 => RequestType::Rollback,
            64 => RequestType::Ping,
            73 => RequestType::Id,
            74 => RequestType::Watch,
            75 => RequestType::Unwatch,
            76 => RequestType::Event,
            128 => RequestType::Chunk,
            _ => return None,
        })
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestType::Ok => "OK",
            RequestType::Select => "SELECT",
            RequestType::Insert => "INSERT",
            RequestType::Replace => "REPLACE",
            RequestType::Update => "UPDATE",
            RequestType::Delete => "DELETE",
            RequestType::Auth => "AUTH",
            RequestType::Eval => "EVAL",
            RequestType::Upsert => "UPSERT",
            RequestType::Call => "CALL",
            RequestType::Execute => "EXECUTE",
            RequestType::Nop => "NOP",
            RequestType::Prepare => "PREPARE",
            RequestType::Begin => "BEGIN",
            RequestType::Commit => "COMMIT",
            RequestType::Rollback => "ROLLBACK",
            RequestType::Ping => "PING",
            RequestType::Id => "ID",
            RequestType::Watch => "WATCH",
            RequestType::Unwatch => "UNWATCH",
            RequestType::Event => "EVENT",
            RequestType::Chunk => "CHUNK",
        };
        f.write_str(name)
    }
}

/// Index iterator used by SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IteratorType {
    #[default]
    Eq,
    Req,
    All,
    Lt,
    Le,
    Ge,
    Gt,
    BitsAllSet,
    BitsAnySet,
    BitsAllNotSet,
    Overlaps,
    Neighbor,
}

impl IteratorType {
    pub fn code(self) -> u32 {
        match self {
            IteratorType::Eq => 0,
            IteratorType::Req => 1,
            IteratorType::All => 2,
            IteratorType::Lt => 3,
            IteratorType::Le => 4,
            IteratorType::Ge => 5,
            IteratorType::Gt => 6,
            IteratorType::BitsAllSet => 7,
            IteratorType::BitsAnySet => 8,
            IteratorType::BitsAllNotSet => 9,
            IteratorType::Overlaps => 10,
            IteratorType::Neighbor => 11,
        }
    }
}

/// Transaction isolation level sent with BEGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionIsolation {
    #[default]
    Default,
    ReadCommitted,
    ReadConfirmed,
    BestEffort,
}

impl TransactionIsolation {
    pub fn code(self) -> u32 {
        match self {
            TransactionIsolation::Default => 0,
            TransactionIsolation::ReadCommitted => 1,
            TransactionIsolation::ReadConfirmed => 2,
            TransactionIsolation::BestEffort => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type_codes_roundtrip() {
        let all = [
            RequestType::Ok,
            RequestType::Select,
            RequestType::Insert,
            RequestType::Replace,
            RequestType::Update,
            RequestType::Delete,
            RequestType::Auth,
            RequestType::Eval,
            RequestType::Upsert,
            RequestType::Call,
            RequestType::Execute,
            RequestType::Nop,
            RequestType::Prepare,
            RequestType::Begin,
            RequestType::Commit,
            RequestType::Rollback,
            RequestType::Ping,
            RequestType::Id,
            RequestType::Watch,
            RequestType::Unwatch,
            RequestType::Event,
            RequestType::Chunk,
        ];
        for ty in all {
            assert_eq!(RequestType::from_code(ty.code()), Some(ty));
        }
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(RequestType::from_code(6), None);
        assert_eq!(RequestType::from_code(TYPE_ERROR | 3), None);
    }

    #[test]
    fn test_request_type_display() {
        assert_eq!(RequestType::Select.to_string(), "SELECT");
        assert_eq!(RequestType::Chunk.to_string(), "CHUNK");
    }

    #[test]
    fn test_iterator_codes() {
        assert_eq!(IteratorType::default().code(), 0);
        assert_eq!(IteratorType::All.code(), 2);
        assert_eq!(IteratorType::Neighbor.code(), 11);
    }
}
