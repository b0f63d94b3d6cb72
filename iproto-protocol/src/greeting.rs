//! Server greeting.
//!
//! On connect the server sends 128 bytes: two 64-byte lines, each padded
//! with spaces and terminated by `\n`.
//!
//! ```text
//! Tarantool 2.11.1 (Binary) 5d6f1a6e-3c1b-4a4f-9a0e-8c3f0b2e1d77     \n
//! QK2HoFZGXTXBq2vFj7soCsHqTo6PGTF575ssUBAJLAI=                      \n
//! ```

use crate::error::GreetingError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use uuid::Uuid;

/// Total greeting size.
pub const GREETING_SIZE: usize = 128;

/// Size of one greeting line.
pub const GREETING_LINE_SIZE: usize = 64;

/// Bytes of salt used by the scramble.
pub const SCRAMBLE_SALT_SIZE: usize = 20;

const MAGIC: &str = "Tarantool";
const BINARY_PROTOCOL: &str = "Binary";

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// Product identifier, e.g. `Tarantool`.
    pub product: String,
    /// Server version string.
    pub version: String,
    /// Protocol type announced by the server.
    pub protocol: String,
    /// Instance UUID.
    pub instance_id: Uuid,
    /// Decoded salt.
    pub salt: Vec<u8>,
}

impl Greeting {
    /// Parses and validates a greeting buffer.
    pub fn parse(buf: &[u8]) -> Result<Self, GreetingError> {
        if buf.is_empty() {
            return Err(GreetingError::Empty);
        }
        if buf.len() < GREETING_SIZE {
            return Err(GreetingError::TooShort {
                len: buf.len(),
                need: GREETING_SIZE,
            });
        }

        let line1 = String::from_utf8_lossy(&buf[..GREETING_LINE_SIZE]);
        let line2 = String::from_utf8_lossy(&buf[GREETING_LINE_SIZE..GREETING_SIZE]);
        let line1 = line1.trim_end();

        let mut words = line1.split_whitespace();
        let product = words.next().unwrap_or_default();
        if product != MAGIC {
            return Err(GreetingError::UnknownMagic(product.to_string()));
        }
        let version = words.next().unwrap_or_default();

        let protocol = words.next().unwrap_or_default();
        let protocol = protocol
            .strip_prefix('(')
            .and_then(|p| p.strip_suffix(')'))
            .unwrap_or(protocol);
        if protocol != BINARY_PROTOCOL {
            // a console port announces "(Lua console)", which splits in two
            let announced = line1
                .split_once('(')
                .and_then(|(_, rest)| rest.split_once(')'))
                .map(|(p, _)| p.to_string())
                .unwrap_or_else(|| protocol.to_string());
            return Err(GreetingError::UnknownProtocol(announced));
        }

        let id = words.next().unwrap_or_default();
        let instance_id =
            Uuid::parse_str(id).map_err(|_| GreetingError::InvalidInstanceId(id.to_string()))?;

        let salt = STANDARD
            .decode(line2.trim())
            .map_err(|_| GreetingError::InvalidSalt)?;
        if salt.len() < SCRAMBLE_SALT_SIZE {
            return Err(GreetingError::InvalidSalt);
        }

        Ok(Self {
            product: product.to_string(),
            version: version.to_string(),
            protocol: protocol.to_string(),
            instance_id,
            salt,
        })
    }

    /// Builds the 128-byte greeting a server would send.
    pub fn encode(&self) -> [u8; GREETING_SIZE] {
        let mut buf = [b' '; GREETING_SIZE];
        let line1 = format!(
            "{} {} ({}) {}",
            self.product, self.version, self.protocol, self.instance_id
        );
        let line2 = STANDARD.encode(&self.salt);

        let n = line1.len().min(GREETING_LINE_SIZE - 1);
        buf[..n].copy_from_slice(&line1.as_bytes()[..n]);
        buf[GREETING_LINE_SIZE - 1] = b'\n';

        let m = line2.len().min(GREETING_LINE_SIZE - 1);
        buf[GREETING_LINE_SIZE..GREETING_LINE_SIZE + m].copy_from_slice(&line2.as_bytes()[..m]);
        buf[GREETING_SIZE - 1] = b'\n';
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const UUID: &str = "5d6f1a6e-3c1b-4a4f-9a0e-8c3f0b2e1d77";

    fn greeting(line1: &str, line2: &str) -> Vec<u8> {
        let mut buf = vec![b' '; GREETING_SIZE];
        buf[..line1.len()].copy_from_slice(line1.as_bytes());
        buf[63] = b'\n';
        buf[64..64 + line2.len()].copy_from_slice(line2.as_bytes());
        buf[127] = b'\n';
        buf
    }

    fn salt() -> String {
        STANDARD.encode([7u8; 32])
    }

    #[test]
    fn test_parse_valid() {
        let buf = greeting(&format!("Tarantool 2.11.1 (Binary) {UUID}"), &salt());
        let parsed = Greeting::parse(&buf).unwrap();
        assert_eq!(parsed.product, "Tarantool");
        assert_eq!(parsed.version, "2.11.1");
        assert_eq!(parsed.protocol, "Binary");
        assert_eq!(parsed.instance_id.to_string(), UUID);
        assert_eq!(parsed.salt, vec![7u8; 32]);
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let greeting = Greeting {
            product: "Tarantool".into(),
            version: "3.1.0".into(),
            protocol: "Binary".into(),
            instance_id: Uuid::parse_str(UUID).unwrap(),
            salt: vec![1u8; 32],
        };
        assert_eq!(Greeting::parse(&greeting.encode()).unwrap(), greeting);
    }

    #[test]
    fn test_empty() {
        assert_eq!(Greeting::parse(&[]), Err(GreetingError::Empty));
    }

    #[test]
    fn test_too_short() {
        assert_eq!(
            Greeting::parse(b"Tarantool"),
            Err(GreetingError::TooShort {
                len: 9,
                need: GREETING_SIZE
            })
        );
    }

    #[test]
    fn test_wrong_magic() {
        let buf = greeting(&format!("Redis 7.0 (Binary) {UUID}"), &salt());
        assert_eq!(
            Greeting::parse(&buf),
            Err(GreetingError::UnknownMagic("Redis".into()))
        );
    }

    #[test]
    fn test_wrong_protocol() {
        let buf = greeting("Tarantool 2.11.1 (Lua console)", "type 'help' for interactive help");
        assert_eq!(
            Greeting::parse(&buf),
            Err(GreetingError::UnknownProtocol("Lua console".into()))
        );
    }

    #[test]
    fn test_bad_uuid() {
        let buf = greeting("Tarantool 2.11.1 (Binary) not-a-uuid", &salt());
        assert_eq!(
            Greeting::parse(&buf),
            Err(GreetingError::InvalidInstanceId("not-a-uuid".into()))
        );
    }

    #[test]
    fn test_bad_salt() {
        let buf = greeting(&format!("Tarantool 2.11.1 (Binary) {UUID}"), "!!!not base64!!!");
        assert_eq!(Greeting::parse(&buf), Err(GreetingError::InvalidSalt));

        let short = STANDARD.encode([1u8; 8]);
        let buf = greeting(&format!("Tarantool 2.11.1 (Binary) {UUID}"), &short);
        assert_eq!(Greeting::parse(&buf), Err(GreetingError::InvalidSalt));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..200)) {
            let _ = Greeting::parse(&data);
        }
    }
}
