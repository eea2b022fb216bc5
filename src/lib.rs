#![forbid(unsafe_code)]

//! Event sequencing and consistency engine for workspace event streams.
//!
//! Mutation events from many concurrent actors get a globally monotonic
//! sequence number plus a per-workspace one, flow through a forward-only
//! lifecycle, and reach consumers in partition order even when delivery is
//! out of order. Vector clocks distinguish causal edits from true conflicts;
//! gapped partitions buffer ahead-of-time arrivals and force progress after
//! a timeout rather than stalling forever.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod ledger;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at crate root for convenience
pub use crate::config::{EngineConfig, EngineConfigOverride, LimitsOverride};
pub use crate::core::{
    checksum_of, ActorId, AppliedSeq, BroadcastStatus, Causality, Checksum, ConflictStrategy,
    EventDraft, EventId, EventKind, EventRecord, EventSeq, EventStatus, IdempotencyKey, Limits,
    PartitionCursor, SessionId, VectorClock, WallClock, WorkspaceId,
};
pub use crate::engine::{
    detect_conflicts, resolve_conflict, Admission, ConflictOutcome, ConflictPair, CreateOutcome,
    GapTracker, Overflow, PartitionStats, ReadyEvent, SequenceOutcome, Sequencer, StreamStats,
};
pub use crate::ledger::{Ledger, MemoryLedger, SqliteLedger};
