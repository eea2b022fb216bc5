//! Identity newtypes used across the engine.
//!
//! String ids are validated at the boundary via `parse`; construction from an
//! unchecked string is deliberately not exposed.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CoreError, InvalidId};

/// Identity of one event record.
///
/// UUID v7: time-ordered, so comparing two ids also compares allocation
/// order. The conflict resolver's `server_wins` rule relies on that.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let uuid = Uuid::parse_str(s).map_err(|e| InvalidId::Event {
            raw: s.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(uuid))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validates one string id under shared length/charset rules.
fn checked_string(
    raw: String,
    max_len: usize,
    err: impl Fn(String, String) -> InvalidId,
) -> Result<String, CoreError> {
    if raw.is_empty() {
        return Err(err(raw, "empty".into()).into());
    }
    if raw.len() > max_len {
        return Err(err(raw, format!("length must be <= {max_len}")).into());
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(err(raw, "contains control character".into()).into());
    }
    Ok(raw)
}

/// Partition identity: an independent namespace with its own monotonic
/// sequence.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkspaceId(String);

impl WorkspaceId {
    const MAX_LEN: usize = 64;

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let raw = s.into();
        if raw.is_empty() {
            return Err(InvalidId::Workspace {
                raw,
                reason: "empty".into(),
            }
            .into());
        }
        if raw.len() > Self::MAX_LEN {
            return Err(InvalidId::Workspace {
                raw,
                reason: format!("length must be <= {}", Self::MAX_LEN),
            }
            .into());
        }
        let bytes = raw.as_bytes();
        if !(bytes[0].is_ascii_lowercase() || bytes[0].is_ascii_digit()) {
            return Err(InvalidId::Workspace {
                raw,
                reason: "must start with [a-z0-9]".into(),
            }
            .into());
        }
        for &b in &bytes[1..] {
            let ok = b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-';
            if !ok {
                return Err(InvalidId::Workspace {
                    raw,
                    reason: "contains invalid character".into(),
                }
                .into());
            }
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An actor producing events: a user, a background job, the transcription
/// pipeline. Keys the vector clock.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(String);

impl ActorId {
    const MAX_LEN: usize = 128;

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        checked_string(s.into(), Self::MAX_LEN, |raw, reason| InvalidId::Actor {
            raw,
            reason,
        })
        .map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Origin session (socket or web session) an event was submitted from.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    const MAX_LEN: usize = 128;

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        checked_string(s.into(), Self::MAX_LEN, |raw, reason| InvalidId::Session {
            raw,
            reason,
        })
        .map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Caller-supplied token for duplicate-submission detection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    const MAX_LEN: usize = 200;

    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        checked_string(s.into(), Self::MAX_LEN, |raw, reason| {
            InvalidId::IdempotencyKey { raw, reason }
        })
        .map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_id_impls {
    ($ty:ident) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "({:?})"), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = CoreError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                $ty::parse(s)
            }
        }

        impl From<$ty> for String {
            fn from(id: $ty) -> String {
                id.0
            }
        }
    };
}

string_id_impls!(WorkspaceId);
string_id_impls!(ActorId);
string_id_impls!(SessionId);
string_id_impls!(IdempotencyKey);
