//! The durable event ledger.
//!
//! The ledger is the sole serialization point for sequence allocation: max-seq
//! reads and the insert that reserves the next number happen inside one
//! transaction, and uniqueness constraints over the sequence columns turn any
//! remaining race into a typed, retryable error.

mod memory;
mod sqlite;

use std::path::PathBuf;

use thiserror::Error;

use crate::core::{EventId, EventRecord, IdempotencyKey, WorkspaceId};
use crate::error::{Effect, Transience};

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("event {id} already stored")]
    DuplicateEventId { id: EventId },

    #[error("global sequence {seq} already allocated")]
    DuplicateGlobalSeq { seq: u64 },

    #[error("partition sequence {seq} already allocated in workspace {workspace}")]
    DuplicatePartitionSeq { workspace: WorkspaceId, seq: u64 },

    #[error("idempotency key {key} already stored")]
    DuplicateIdempotencyKey { key: IdempotencyKey },

    #[error("event {id} not in ledger")]
    NotFound { id: EventId },

    #[error("another transaction holds the ledger")]
    Busy,

    #[error("ledger lock poisoned")]
    Poisoned,

    #[error("ledger path {path} is a symlink")]
    SymlinkPath { path: PathBuf },

    #[error("stored {what} is malformed: {reason}")]
    Corrupt { what: &'static str, reason: String },

    #[error("ledger row does not encode: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    pub fn transience(&self) -> Transience {
        match self {
            // Duplicates resolve under a fresh allocation attempt.
            LedgerError::DuplicateEventId { .. }
            | LedgerError::DuplicateGlobalSeq { .. }
            | LedgerError::DuplicatePartitionSeq { .. }
            | LedgerError::DuplicateIdempotencyKey { .. }
            | LedgerError::Busy => Transience::Retryable,
            LedgerError::NotFound { .. }
            | LedgerError::Poisoned
            | LedgerError::SymlinkPath { .. }
            | LedgerError::Corrupt { .. }
            | LedgerError::Encode(_) => Transience::Permanent,
            LedgerError::Sqlite(e) => match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::DatabaseBusy)
                | Some(rusqlite::ErrorCode::DatabaseLocked) => Transience::Retryable,
                _ => Transience::Unknown,
            },
            LedgerError::Io(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            LedgerError::DuplicateEventId { .. }
            | LedgerError::DuplicateGlobalSeq { .. }
            | LedgerError::DuplicatePartitionSeq { .. }
            | LedgerError::DuplicateIdempotencyKey { .. }
            | LedgerError::NotFound { .. }
            | LedgerError::Busy
            | LedgerError::SymlinkPath { .. }
            | LedgerError::Corrupt { .. }
            | LedgerError::Encode(_) => Effect::None,
            LedgerError::Poisoned | LedgerError::Sqlite(_) | LedgerError::Io(_) => {
                Effect::Unknown
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.transience().is_retryable()
    }
}

/// Handle to one ledger backend.
pub trait Ledger: Send + Sync {
    fn writer(&self) -> &dyn LedgerWriter;
    fn reader(&self) -> &dyn LedgerReader;
}

pub trait LedgerWriter: Send + Sync {
    /// Open a transaction holding the write side exclusively.
    fn begin_txn(&self) -> Result<Box<dyn LedgerTxn + '_>, LedgerError>;
}

/// One exclusive transaction. Dropping without `commit` rolls back.
pub trait LedgerTxn {
    /// Highest allocated global sequence, 0 when empty. Read under the
    /// transaction's exclusive lock.
    fn max_global_seq(&mut self) -> Result<u64, LedgerError>;

    /// Highest allocated sequence within `workspace`, 0 when none.
    fn max_partition_seq(&mut self, workspace: &WorkspaceId) -> Result<u64, LedgerError>;

    fn fetch(&mut self, id: &EventId) -> Result<Option<EventRecord>, LedgerError>;

    fn find_idempotent(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<EventRecord>, LedgerError>;

    fn insert_event(&mut self, record: &EventRecord) -> Result<(), LedgerError>;

    /// Rewrite the mutable lifecycle fields of an existing record.
    fn update_event(&mut self, record: &EventRecord) -> Result<(), LedgerError>;

    fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    fn rollback(self: Box<Self>) -> Result<(), LedgerError>;
}

impl std::fmt::Debug for dyn LedgerTxn + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LedgerTxn")
    }
}

/// Read-only queries outside any transaction.
pub trait LedgerReader: Send + Sync {
    fn fetch(&self, id: &EventId) -> Result<Option<EventRecord>, LedgerError>;

    fn max_global_seq(&self) -> Result<u64, LedgerError>;

    fn max_partition_seq(&self, workspace: &WorkspaceId) -> Result<u64, LedgerError>;

    /// Completed events whose broadcast status is still pending, ordered by
    /// global sequence.
    fn pending_broadcast(&self, limit: usize) -> Result<Vec<EventRecord>, LedgerError>;
}
