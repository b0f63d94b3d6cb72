//! Authentication mechanisms.

use crate::error::GreetingError;
use crate::greeting::SCRAMBLE_SALT_SIZE;
use crate::message::Request;
use crate::request;
use rmpv::Value;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Supported authentication mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMechanism {
    /// SHA1 challenge-response over the greeting salt.
    #[default]
    ChapSha1,
    /// Plain password, hashed server-side. Only safe over an encrypted link.
    PapSha256,
}

impl AuthMechanism {
    /// Wire name sent in the auth tuple.
    pub fn name(self) -> &'static str {
        match self {
            AuthMechanism::ChapSha1 => "chap-sha1",
            AuthMechanism::PapSha256 => "pap-sha256",
        }
    }

    /// Builds the AUTH request for `user`.
    pub fn auth_request(
        self,
        user: &str,
        password: &str,
        salt: &[u8],
    ) -> Result<Request, GreetingError> {
        let scramble = match self {
            AuthMechanism::ChapSha1 => Value::Binary(chap_sha1_scramble(password, salt)?.to_vec()),
            AuthMechanism::PapSha256 => Value::from(password),
        };
        Ok(request::auth(user, self, scramble))
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AuthMechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chap-sha1" | "chap_sha1" => Ok(AuthMechanism::ChapSha1),
            "pap-sha256" | "pap_sha256" => Ok(AuthMechanism::PapSha256),
            other => Err(format!("unknown auth mechanism: {other}")),
        }
    }
}

/// `sha1(password) XOR sha1(salt[..20] ++ sha1(sha1(password)))`.
pub fn chap_sha1_scramble(password: &str, salt: &[u8]) -> Result<[u8; 20], GreetingError> {
    if salt.len() < SCRAMBLE_SALT_SIZE {
        return Err(GreetingError::InvalidSalt);
    }

    let step1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let step2: [u8; 20] = Sha1::digest(step1).into();

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SALT_SIZE]);
    hasher.update(step2);
    let step3: [u8; 20] = hasher.finalize().into();

    let mut scramble = [0u8; 20];
    for (i, byte) in scramble.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    Ok(scramble)
}
