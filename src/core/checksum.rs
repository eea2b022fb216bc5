//! Payload integrity digests.
//!
//! Integrity checking here is best-effort: a payload that cannot be encoded
//! canonically gets the fixed sentinel digest and a warning, never an error.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use super::json_canon::to_canon_json_bytes;
use super::CoreError;

const SENTINEL_INPUT: &[u8] = b"metronome/unencodable-payload/v1";

/// Hex-encoded SHA-256 digest of a canonically encoded payload.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let raw = s.into();
        let ok = raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if !ok {
            return Err(CoreError::MalformedChecksum { raw });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Checksum {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Checksum::parse(s)
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> String {
        c.0
    }
}

/// Digest of a payload under canonical JSON encoding.
///
/// An absent payload hashes the canonical `null`, so "no payload" still has a
/// verifiable stamp.
pub fn checksum_of<T: Serialize>(payload: Option<&T>) -> Checksum {
    let bytes = match payload {
        Some(value) => match to_canon_json_bytes(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "payload not canonically encodable, stamping sentinel checksum");
                return sentinel_checksum();
            }
        },
        None => b"null".to_vec(),
    };
    Checksum(hex_digest(&bytes))
}

/// The fixed digest stamped when a payload cannot be encoded.
pub fn sentinel_checksum() -> Checksum {
    Checksum(hex_digest(SENTINEL_INPUT))
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}
