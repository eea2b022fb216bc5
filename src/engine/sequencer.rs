//! Event intake, sequence allocation, and lifecycle transitions.
//!
//! The sequencer is the write path: it stamps drafts (checksum, clock),
//! allocates global and partition sequence numbers inside one ledger
//! transaction, and drives the pending → processing → completed/failed
//! lifecycle. Reading the persisted maxima and inserting the new row commit
//! together, so the allocator itself can never leave a hole; races surface
//! as uniqueness violations and are retried with fresh numbers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::core::{
    checksum_of, AppliedSeq, BroadcastStatus, Checksum, ConflictStrategy, EventDraft, EventId,
    EventRecord, EventStatus, VectorClock, WallClock, WorkspaceId,
};
use crate::error::Error;
use crate::ledger::Ledger;
use crate::Result;

use super::conflict::{self, ConflictOutcome};
use super::gap::{Admission, GapTracker, ReadyEvent, SequenceOutcome, StreamStats};
use super::EngineError;

/// Whether `create_event` persisted a new record or replayed an existing one
/// for a reused idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(EventRecord),
    Replayed(EventRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &EventRecord {
        match self {
            CreateOutcome::Created(record) | CreateOutcome::Replayed(record) => record,
        }
    }

    pub fn into_record(self) -> EventRecord {
        match self {
            CreateOutcome::Created(record) | CreateOutcome::Replayed(record) => record,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, CreateOutcome::Replayed(_))
    }
}

/// Observability snapshot for one workspace.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionStats {
    pub workspace: WorkspaceId,
    /// Highest partition sequence ever persisted.
    pub ledger_max_seq: u64,
    /// Live stream state; absent until the first intake for this workspace.
    pub stream: Option<StreamStats>,
}

pub struct Sequencer {
    ledger: Arc<dyn Ledger>,
    gaps: GapTracker,
    config: EngineConfig,
}

impl Sequencer {
    pub fn new(ledger: Arc<dyn Ledger>, config: EngineConfig) -> Self {
        let gaps = GapTracker::new(config.limits.clone());
        Self {
            ledger,
            gaps,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stamp and durably sequence a draft.
    ///
    /// A draft with an actor gets its clock advanced over the prior clock;
    /// a prior clock without an actor is carried through untouched. Reused
    /// idempotency keys replay the original record when the payload matches
    /// and fail otherwise. Allocation contention retries internally with
    /// jittered backoff.
    pub fn create_event(&self, draft: EventDraft) -> Result<CreateOutcome> {
        let checksum = checksum_of(draft.payload.as_ref());
        let clock = match (&draft.actor, &draft.prior_clock) {
            (Some(actor), prior) => Some(prior.clone().unwrap_or_default().advance(actor)),
            (None, prior) => prior.clone(),
        };

        let max_attempts = self.config.limits.max_alloc_retries.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_create(&draft, &checksum, clock.as_ref()) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.transience().is_retryable() && attempt < max_attempts => {
                    tracing::debug!("sequence allocation attempt {attempt} contended: {err}");
                    self.backoff(attempt);
                }
                Err(err) if err.transience().is_retryable() => {
                    tracing::warn!("sequence allocation gave up after {attempt} attempts: {err}");
                    return Err(EngineError::AllocationContended { attempts: attempt }.into());
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_create(
        &self,
        draft: &EventDraft,
        checksum: &Checksum,
        clock: Option<&VectorClock>,
    ) -> Result<CreateOutcome> {
        let mut txn = self.ledger.writer().begin_txn().map_err(Error::from)?;

        if let Some(key) = &draft.idempotency_key {
            if let Some(existing) = txn.find_idempotent(key)? {
                if existing.checksum == *checksum {
                    tracing::debug!("idempotency key {key} replayed event {}", existing.id);
                    return Ok(CreateOutcome::Replayed(existing));
                }
                return Err(EngineError::IdempotentReplayMismatch { key: key.clone() }.into());
            }
        }

        let global_seq = AppliedSeq::new(txn.max_global_seq()?).next();
        let partition_seq = match &draft.workspace {
            Some(workspace) => Some(AppliedSeq::new(txn.max_partition_seq(workspace)?).next()),
            None => None,
        };

        let record = EventRecord {
            id: EventId::generate(),
            kind: draft.kind,
            name: draft.name.clone(),
            workspace: draft.workspace.clone(),
            origin_session: draft.origin_session.clone(),
            payload: draft.payload.clone(),
            status: EventStatus::Pending,
            global_seq,
            partition_seq,
            checksum: checksum.clone(),
            clock: clock.cloned(),
            idempotency_key: draft.idempotency_key.clone(),
            broadcast: BroadcastStatus::Pending,
            created_at_ms: WallClock::now().ms(),
            started_at_ms: None,
            completed_at_ms: None,
            duration_ms: None,
            result: None,
            error: None,
            last_applied: None,
        };
        txn.insert_event(&record)?;
        txn.commit()?;
        Ok(CreateOutcome::Created(record))
    }

    /// Exponential backoff from the configured base, jittered so competing
    /// writers spread out.
    fn backoff(&self, attempt: u32) {
        let base = self.config.limits.alloc_backoff_base_ms.max(1);
        let exp = base << (attempt - 1).min(6);
        let jitter = rand::rng().random_range(0..=base);
        thread::sleep(Duration::from_millis(exp + jitter));
    }

    /// Move a pending event to processing. `Ok(None)` when the id is
    /// unknown.
    pub fn mark_processing(&self, id: &EventId) -> Result<Option<EventRecord>> {
        self.transition(id, EventStatus::Processing, |record, now_ms| {
            record.started_at_ms = Some(now_ms);
        })
    }

    /// Complete an event, storing its result and marking it as the last
    /// applied event of its own chain. Duration falls back to the measured
    /// processing time when the caller does not supply one.
    pub fn mark_completed(
        &self,
        id: &EventId,
        result: Option<Value>,
        duration_ms: Option<u64>,
        broadcast: BroadcastStatus,
    ) -> Result<Option<EventRecord>> {
        self.transition(id, EventStatus::Completed, |record, now_ms| {
            record.completed_at_ms = Some(now_ms);
            record.duration_ms = duration_ms.or_else(|| {
                record
                    .started_at_ms
                    .map(|started| now_ms.saturating_sub(started))
            });
            record.result = result;
            record.broadcast = broadcast;
            record.last_applied = Some(record.id);
        })
    }

    pub fn mark_failed(
        &self,
        id: &EventId,
        error: impl Into<String>,
        broadcast: BroadcastStatus,
    ) -> Result<Option<EventRecord>> {
        let message = error.into();
        self.transition(id, EventStatus::Failed, |record, now_ms| {
            record.completed_at_ms = Some(now_ms);
            record.duration_ms = record
                .started_at_ms
                .map(|started| now_ms.saturating_sub(started));
            record.error = Some(message);
            record.broadcast = broadcast;
        })
    }

    /// Record the transport's verdict for an already-completed event. Not
    /// gated by the lifecycle state machine: broadcast status is its own
    /// small lifecycle.
    pub fn mark_broadcast(
        &self,
        id: &EventId,
        status: BroadcastStatus,
    ) -> Result<Option<EventRecord>> {
        let mut txn = self.ledger.writer().begin_txn().map_err(Error::from)?;
        let Some(mut record) = txn.fetch(id)? else {
            return Ok(None);
        };
        record.broadcast = status;
        txn.update_event(&record)?;
        txn.commit()?;
        Ok(Some(record))
    }

    fn transition<F>(&self, id: &EventId, to: EventStatus, mutate: F) -> Result<Option<EventRecord>>
    where
        F: FnOnce(&mut EventRecord, u64),
    {
        let mut txn = self.ledger.writer().begin_txn().map_err(Error::from)?;
        let Some(mut record) = txn.fetch(id)? else {
            return Ok(None);
        };
        if !record.status.can_advance_to(to) {
            return Err(EngineError::InvalidTransition {
                id: *id,
                from: record.status,
                to,
            }
            .into());
        }
        record.status = to;
        mutate(&mut record, WallClock::now().ms());
        txn.update_event(&record)?;
        txn.commit()?;
        Ok(Some(record))
    }

    /// Check whether `id` would apply next in its partition.
    ///
    /// With `expected_last`, validates the direct chain: same workspace and
    /// exactly one sequence apart. Without it, compares against the live
    /// stream cursor (zero if the workspace has never been seen). Events
    /// outside any workspace always validate.
    pub fn validate_sequence(&self, id: &EventId, expected_last: Option<&EventId>) -> Result<bool> {
        let event = self.fetch_known(id)?;
        let (Some(workspace), Some(seq)) = (&event.workspace, event.partition_seq) else {
            return Ok(true);
        };

        if let Some(last_id) = expected_last {
            let last = self.fetch_known(last_id)?;
            let chained = last.workspace.as_ref() == Some(workspace)
                && last.partition_seq.map(|s| s.next()) == Some(seq);
            return Ok(chained);
        }

        let applied = self
            .gaps
            .cursor(workspace)
            .map_err(Error::from)?
            .map(|cursor| cursor.applied)
            .unwrap_or(AppliedSeq::ZERO);
        Ok(applied.is_next(seq))
    }

    /// Recommended intake path for partition consumers: verify the event
    /// belongs to `workspace`, re-verify its checksum (a mismatch logs and
    /// continues), and run it through the gap buffer. The outcome carries
    /// the arrival's classification plus every event released in apply
    /// order.
    pub fn validate_and_sequence_event(
        &self,
        workspace: &WorkspaceId,
        event: EventRecord,
    ) -> Result<SequenceOutcome> {
        match &event.workspace {
            Some(ws) if ws == workspace => {}
            _ => {
                return Err(EngineError::NotInWorkspace {
                    id: event.id,
                    workspace: workspace.clone(),
                }
                .into())
            }
        }
        if event.partition_seq.is_none() {
            return Err(EngineError::Unsequenced { id: event.id }.into());
        }
        if !event.verify_checksum() {
            tracing::warn!("checksum mismatch on event {}; applying anyway", event.id);
        }

        let outcome = self
            .gaps
            .ingest(event, WallClock::now().ms())
            .map_err(Error::from)?;
        if let Admission::Rejected(overflow) = &outcome.admission {
            tracing::warn!("workspace {workspace} rejected arrival: {overflow}");
        }
        Ok(outcome)
    }

    /// Completed events the transport has not delivered yet, in global
    /// order. `limit` is clamped to the configured batch cap.
    pub fn get_pending_broadcast_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let capped = limit.min(self.config.limits.max_broadcast_batch);
        Ok(self.ledger.reader().pending_broadcast(capped)?)
    }

    pub fn get_partition_stats(&self, workspace: &WorkspaceId) -> Result<PartitionStats> {
        Ok(PartitionStats {
            workspace: workspace.clone(),
            ledger_max_seq: self.ledger.reader().max_partition_seq(workspace)?,
            stream: self
                .gaps
                .stats(workspace, WallClock::now().ms())
                .map_err(Error::from)?,
        })
    }

    /// Force progress on every stalled workspace stream. Returns released
    /// events grouped by workspace; callers must route them to consumers
    /// like any other ready batch.
    pub fn sweep_stalled_partitions(&self) -> Result<Vec<(WorkspaceId, Vec<ReadyEvent>)>> {
        Ok(self.gaps.sweep_stalled(WallClock::now().ms())?)
    }

    /// Operator path: discard buffered events and pin the stream cursor.
    pub fn reset_partition(&self, workspace: &WorkspaceId, applied: AppliedSeq) -> Result<usize> {
        Ok(self
            .gaps
            .reset(workspace, applied, WallClock::now().ms())?)
    }

    /// Resolve a conflict, falling back to the configured default strategy.
    pub fn resolve_conflict(
        &self,
        a: &EventRecord,
        b: &EventRecord,
        strategy: Option<ConflictStrategy>,
    ) -> ConflictOutcome {
        conflict::resolve_conflict(a, b, strategy.unwrap_or(self.config.default_strategy))
    }

    fn fetch_known(&self, id: &EventId) -> Result<EventRecord> {
        self.ledger
            .reader()
            .fetch(id)?
            .ok_or_else(|| EngineError::UnknownEvent { id: *id }.into())
    }
}
