//! Structured server errors.

use crate::constants::{body_key, error_key};
use crate::message::Response;
use rmpv::Value;
use std::collections::BTreeMap;
use std::fmt;

/// One entry of the server's error stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorEntry {
    pub error_type: String,
    pub file: String,
    pub line: u64,
    pub message: String,
    pub errno: u64,
    pub code: u64,
    /// Extra type-specific fields, keyed by name.
    pub fields: BTreeMap<String, Value>,
}

impl ErrorEntry {
    fn from_value(value: &Value) -> Option<Self> {
        let Value::Map(entries) = value else {
            return None;
        };
        let mut entry = ErrorEntry::default();
        for (key, value) in entries {
            let Some(key) = key.as_u64() else { continue };
            match key as u8 {
                error_key::TYPE => entry.error_type = as_string(value),
                error_key::FILE => entry.file = as_string(value),
                error_key::LINE => entry.line = value.as_u64().unwrap_or_default(),
                error_key::MESSAGE => entry.message = as_string(value),
                error_key::ERRNO => entry.errno = value.as_u64().unwrap_or_default(),
                error_key::CODE => entry.code = value.as_u64().unwrap_or_default(),
                error_key::FIELDS => {
                    if let Value::Map(fields) = value {
                        for (name, field) in fields {
                            entry.fields.insert(as_string(name), field.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        Some(entry)
    }
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.as_str().unwrap_or_default().to_string(),
        other => other.to_string(),
    }
}

/// An error reported by the server, surfaced verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    /// Error code taken from the response type.
    pub code: u32,
    /// Human-readable message (`ERROR_24`).
    pub message: String,
    /// Structured stack, innermost cause last. Empty on servers that do not
    /// send the extended error body.
    pub stack: Vec<ErrorEntry>,
}

impl ServerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Decodes the message and stack from an error response. Fields that
    /// fail to decode are left empty rather than hiding the error itself.
    pub fn from_response(code: u32, response: &Response) -> Self {
        let message = match response.field(body_key::ERROR_24) {
            Ok(Some(value)) => as_string(&value),
            _ => String::new(),
        };

        let stack = match response.field(body_key::ERROR) {
            Ok(Some(Value::Map(entries))) => entries
                .iter()
                .find(|(k, _)| k.as_u64() == Some(error_key::STACK as u64))
                .and_then(|(_, v)| v.as_array())
                .map(|items| items.iter().filter_map(ErrorEntry::from_value).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let message = if message.is_empty() {
            stack.first().map(|e| e.message.clone()).unwrap_or_default()
        } else {
            message
        };

        Self {
            code,
            message,
            stack,
        }
    }

    /// Type name of the outermost error, e.g. `ClientError`.
    pub fn error_type(&self) -> Option<&str> {
        self.stack.first().map(|e| e.error_type.as_str())
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServerError {}
