//! Canonical error types for core domain values.

use thiserror::Error;

use crate::error::{Effect, Transience};

use super::json_canon::CanonJsonError;

/// A raw value failed identity validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidId {
    #[error("invalid event id {raw:?}: {reason}")]
    Event { raw: String, reason: String },

    #[error("invalid workspace id {raw:?}: {reason}")]
    Workspace { raw: String, reason: String },

    #[error("invalid actor id {raw:?}: {reason}")]
    Actor { raw: String, reason: String },

    #[error("invalid session id {raw:?}: {reason}")]
    Session { raw: String, reason: String },

    #[error("invalid idempotency key {raw:?}: {reason}")]
    IdempotencyKey { raw: String, reason: String },
}

/// Errors raised while validating or encoding core domain values.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("unknown event kind {raw:?}")]
    UnknownEventKind { raw: String },

    #[error("unknown event status {raw:?}")]
    UnknownEventStatus { raw: String },

    #[error("unknown broadcast status {raw:?}")]
    UnknownBroadcastStatus { raw: String },

    #[error("unknown conflict strategy {raw:?}")]
    UnknownConflictStrategy { raw: String },

    #[error("malformed checksum {raw:?}")]
    MalformedChecksum { raw: String },

    #[error(transparent)]
    CanonJson(#[from] CanonJsonError),
}

impl CoreError {
    /// Core errors are input-shaped: retrying the same value never helps.
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
