//! Sequencing, lifecycle, gap recovery, and conflict resolution over a ledger.

mod conflict;
mod gap;
mod sequencer;

pub use conflict::{detect_conflicts, resolve_conflict, ConflictOutcome, ConflictPair};
pub use gap::{Admission, GapTracker, Overflow, ReadyEvent, SequenceOutcome, StreamStats};
pub use sequencer::{CreateOutcome, PartitionStats, Sequencer};

use thiserror::Error;

use crate::core::{EventId, EventStatus, IdempotencyKey, WorkspaceId};
use crate::error::{Effect, Transience};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    #[error("event {id} not found")]
    UnknownEvent { id: EventId },

    #[error("event {id} does not belong to workspace {workspace}")]
    NotInWorkspace { id: EventId, workspace: WorkspaceId },

    #[error("event {id} carries no partition sequence")]
    Unsequenced { id: EventId },

    #[error("event {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: EventId,
        from: EventStatus,
        to: EventStatus,
    },

    #[error("idempotency key {key} was already used for a different payload")]
    IdempotentReplayMismatch { key: IdempotencyKey },

    #[error("sequence allocation still contended after {attempts} attempts")]
    AllocationContended { attempts: u32 },

    #[error("engine lock poisoned")]
    LockPoisoned,
}

impl EngineError {
    pub fn transience(&self) -> Transience {
        match self {
            EngineError::AllocationContended { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            EngineError::LockPoisoned => Effect::Unknown,
            _ => Effect::None,
        }
    }
}
