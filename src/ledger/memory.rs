//! In-memory ledger for tests and single-process embedding.
//!
//! Transactions clone the committed state and work on the copy; commit swaps
//! the copy back in. A single atomic gate serializes writers, so a second
//! `begin_txn` while one is open fails with [`LedgerError::Busy`] rather than
//! blocking. Readers always see the last committed state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::core::{BroadcastStatus, EventId, EventRecord, EventStatus, IdempotencyKey, WorkspaceId};

use super::{Ledger, LedgerError, LedgerReader, LedgerTxn, LedgerWriter};

#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<MemState>,
    txn_gate: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn writer(&self) -> &dyn LedgerWriter {
        self
    }

    fn reader(&self) -> &dyn LedgerReader {
        self
    }
}

impl LedgerWriter for MemoryLedger {
    fn begin_txn(&self) -> Result<Box<dyn LedgerTxn + '_>, LedgerError> {
        if self
            .txn_gate
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return Err(LedgerError::Busy);
        }
        let working = match self.state.read() {
            Ok(state) => state.clone(),
            Err(_) => {
                self.txn_gate.store(false, Ordering::Release);
                return Err(LedgerError::Poisoned);
            }
        };
        Ok(Box::new(MemTxn {
            ledger: self,
            working,
        }))
    }
}

impl LedgerReader for MemoryLedger {
    fn fetch(&self, id: &EventId) -> Result<Option<EventRecord>, LedgerError> {
        let state = self.state.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(state.events.get(id).cloned())
    }

    fn max_global_seq(&self) -> Result<u64, LedgerError> {
        let state = self.state.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(state.max_global())
    }

    fn max_partition_seq(&self, workspace: &WorkspaceId) -> Result<u64, LedgerError> {
        let state = self.state.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(state.max_partition(workspace))
    }

    fn pending_broadcast(&self, limit: usize) -> Result<Vec<EventRecord>, LedgerError> {
        let state = self.state.read().map_err(|_| LedgerError::Poisoned)?;
        Ok(state.pending_broadcast(limit))
    }
}

struct MemTxn<'a> {
    ledger: &'a MemoryLedger,
    working: MemState,
}

impl LedgerTxn for MemTxn<'_> {
    fn max_global_seq(&mut self) -> Result<u64, LedgerError> {
        Ok(self.working.max_global())
    }

    fn max_partition_seq(&mut self, workspace: &WorkspaceId) -> Result<u64, LedgerError> {
        Ok(self.working.max_partition(workspace))
    }

    fn fetch(&mut self, id: &EventId) -> Result<Option<EventRecord>, LedgerError> {
        Ok(self.working.events.get(id).cloned())
    }

    fn find_idempotent(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<EventRecord>, LedgerError> {
        Ok(self
            .working
            .by_idem
            .get(key)
            .and_then(|id| self.working.events.get(id))
            .cloned())
    }

    fn insert_event(&mut self, record: &EventRecord) -> Result<(), LedgerError> {
        self.working.insert(record)
    }

    fn update_event(&mut self, record: &EventRecord) -> Result<(), LedgerError> {
        self.working.update(record)
    }

    fn commit(mut self: Box<Self>) -> Result<(), LedgerError> {
        let mut state = self
            .ledger
            .state
            .write()
            .map_err(|_| LedgerError::Poisoned)?;
        *state = std::mem::take(&mut self.working);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), LedgerError> {
        Ok(())
    }
}

impl Drop for MemTxn<'_> {
    fn drop(&mut self) {
        self.ledger.txn_gate.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default, Clone)]
struct MemState {
    events: HashMap<EventId, EventRecord>,
    by_global: BTreeMap<u64, EventId>,
    by_partition: HashMap<WorkspaceId, BTreeMap<u64, EventId>>,
    by_idem: HashMap<IdempotencyKey, EventId>,
}

impl MemState {
    fn max_global(&self) -> u64 {
        self.by_global.keys().next_back().copied().unwrap_or(0)
    }

    fn max_partition(&self, workspace: &WorkspaceId) -> u64 {
        self.by_partition
            .get(workspace)
            .and_then(|seqs| seqs.keys().next_back().copied())
            .unwrap_or(0)
    }

    fn insert(&mut self, record: &EventRecord) -> Result<(), LedgerError> {
        if self.events.contains_key(&record.id) {
            return Err(LedgerError::DuplicateEventId { id: record.id });
        }
        if let Some(key) = &record.idempotency_key {
            if self.by_idem.contains_key(key) {
                return Err(LedgerError::DuplicateIdempotencyKey { key: key.clone() });
            }
        }
        let global = record.global_seq.get();
        if self.by_global.contains_key(&global) {
            return Err(LedgerError::DuplicateGlobalSeq { seq: global });
        }
        if let (Some(workspace), Some(seq)) = (&record.workspace, record.partition_seq) {
            let taken = self
                .by_partition
                .get(workspace)
                .is_some_and(|seqs| seqs.contains_key(&seq.get()));
            if taken {
                return Err(LedgerError::DuplicatePartitionSeq {
                    workspace: workspace.clone(),
                    seq: seq.get(),
                });
            }
        }

        self.by_global.insert(global, record.id);
        if let (Some(workspace), Some(seq)) = (&record.workspace, record.partition_seq) {
            self.by_partition
                .entry(workspace.clone())
                .or_default()
                .insert(seq.get(), record.id);
        }
        if let Some(key) = &record.idempotency_key {
            self.by_idem.insert(key.clone(), record.id);
        }
        self.events.insert(record.id, record.clone());
        Ok(())
    }

    /// Only lifecycle fields move; identity and sequence columns are frozen
    /// at insert, same as the SQLite backend.
    fn update(&mut self, record: &EventRecord) -> Result<(), LedgerError> {
        let slot = self
            .events
            .get_mut(&record.id)
            .ok_or(LedgerError::NotFound { id: record.id })?;
        slot.status = record.status;
        slot.broadcast = record.broadcast;
        slot.started_at_ms = record.started_at_ms;
        slot.completed_at_ms = record.completed_at_ms;
        slot.duration_ms = record.duration_ms;
        slot.result = record.result.clone();
        slot.error = record.error.clone();
        slot.last_applied = record.last_applied;
        Ok(())
    }

    fn pending_broadcast(&self, limit: usize) -> Vec<EventRecord> {
        self.by_global
            .values()
            .filter_map(|id| self.events.get(id))
            .filter(|event| {
                event.status == EventStatus::Completed
                    && event.broadcast == BroadcastStatus::Pending
            })
            .take(limit)
            .cloned()
            .collect()
    }
}
