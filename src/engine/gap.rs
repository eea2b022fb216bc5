//! Out-of-order buffering and forced progress for partition streams.
//!
//! Each workspace stream holds a cursor (highest contiguously applied
//! partition sequence) and a bounded buffer of events that arrived early.
//! Arrivals at cursor + 1 apply immediately and drain any contiguous run
//! behind them. When a gap outlives its timeout the stream skips to the
//! lowest buffered sequence and releases what it has, flagging every
//! released event with the sequences that were never seen.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::core::{AppliedSeq, EventRecord, EventSeq, Limits, PartitionCursor, WorkspaceId};

use super::EngineError;

/// An event released for application, with recovery context.
#[derive(Clone, Debug)]
pub struct ReadyEvent {
    pub event: EventRecord,
    /// True when forced progress skipped sequences before this event.
    pub needs_reconciliation: bool,
    /// Sequences skipped over, oldest first. Empty unless flagged.
    pub missing_seqs: Vec<EventSeq>,
}

/// Why a buffered arrival could not be admitted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    #[error("gap buffer full ({buffered} events, max {max})")]
    Events { buffered: usize, max: usize },

    #[error("gap buffer full ({buffered_bytes} bytes, max {max})")]
    Bytes { buffered_bytes: usize, max: usize },
}

/// How an arrival was classified against the stream cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Arrival was cursor + 1 and has been applied.
    Applied,
    /// Arrival is ahead of the cursor and now waits in the buffer.
    Buffered { want: EventSeq, buffered: usize },
    /// Arrival is at or behind the cursor, or already buffered.
    Duplicate { seq: EventSeq },
    /// Buffer capacity exhausted; the event was dropped.
    Rejected(Overflow),
}

/// Result of one ingest call: the arrival's classification plus every event
/// the call released, in apply order. Forced progress can release events
/// even when the arrival itself is buffered or a duplicate.
#[derive(Debug)]
pub struct SequenceOutcome {
    pub admission: Admission,
    pub ready: Vec<ReadyEvent>,
}

impl SequenceOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self.admission, Admission::Rejected(_))
    }
}

/// Point-in-time view of one stream.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StreamStats {
    pub applied: u64,
    pub next_expected: u64,
    pub buffered_events: usize,
    pub buffered_bytes: usize,
    pub last_apply_ms: u64,
    pub stalled: bool,
    pub total_forced: u64,
}

#[derive(Debug, Clone)]
struct BufferedEvent {
    event: EventRecord,
    size: usize,
    needs_reconciliation: bool,
    missing_seqs: Vec<EventSeq>,
}

#[derive(Debug)]
struct StreamState {
    cursor: PartitionCursor,
    buffered: BTreeMap<EventSeq, BufferedEvent>,
    buffered_bytes: usize,
    gap_since_ms: Option<u64>,
    total_forced: u64,
    max_events: usize,
    max_bytes: usize,
    timeout_ms: u64,
}

impl StreamState {
    fn new(workspace: WorkspaceId, limits: &Limits, now_ms: u64) -> Self {
        Self {
            cursor: PartitionCursor::new(workspace, now_ms),
            buffered: BTreeMap::new(),
            buffered_bytes: 0,
            gap_since_ms: None,
            total_forced: 0,
            max_events: limits.max_gap_buffer_events,
            max_bytes: limits.max_gap_buffer_bytes,
            timeout_ms: limits.gap_timeout_ms,
        }
    }

    fn ingest(&mut self, seq: EventSeq, event: EventRecord, now_ms: u64) -> SequenceOutcome {
        let mut ready = Vec::new();
        if self.is_stalled(now_ms) {
            self.force_progress(now_ms, &mut ready);
        }

        if seq.get() <= self.cursor.applied.get() {
            return SequenceOutcome {
                admission: Admission::Duplicate { seq },
                ready,
            };
        }

        if self.cursor.applied.is_next(seq) {
            self.apply(event, now_ms, false, Vec::new(), &mut ready);
            self.drain_contiguous(now_ms, &mut ready);
            return SequenceOutcome {
                admission: Admission::Applied,
                ready,
            };
        }

        if self.buffered.contains_key(&seq) {
            return SequenceOutcome {
                admission: Admission::Duplicate { seq },
                ready,
            };
        }

        if self.buffered.len() >= self.max_events {
            return SequenceOutcome {
                admission: Admission::Rejected(Overflow::Events {
                    buffered: self.buffered.len(),
                    max: self.max_events,
                }),
                ready,
            };
        }
        let size = event.approx_size();
        if self.buffered_bytes + size > self.max_bytes {
            return SequenceOutcome {
                admission: Admission::Rejected(Overflow::Bytes {
                    buffered_bytes: self.buffered_bytes,
                    max: self.max_bytes,
                }),
                ready,
            };
        }

        self.gap_since_ms.get_or_insert(now_ms);
        self.buffered_bytes += size;
        self.buffered.insert(
            seq,
            BufferedEvent {
                event,
                size,
                needs_reconciliation: false,
                missing_seqs: Vec::new(),
            },
        );
        let admission = Admission::Buffered {
            want: self.cursor.applied.next(),
            buffered: self.buffered.len(),
        };
        // Re-check contiguity: the buffer may now touch the applied prefix.
        self.drain_contiguous(now_ms, &mut ready);
        SequenceOutcome { admission, ready }
    }

    /// A stream is stalled when it holds buffered events and neither an apply
    /// nor the gap's formation happened within the timeout window.
    fn is_stalled(&self, now_ms: u64) -> bool {
        if self.buffered.is_empty() {
            return false;
        }
        let anchor = self.cursor.applied_at_ms.max(self.gap_since_ms.unwrap_or(0));
        now_ms.saturating_sub(anchor) >= self.timeout_ms
    }

    /// Skip the cursor to just below the lowest buffered sequence and drain.
    /// Every event still buffered is flagged and accumulates the skipped
    /// sequences, so a later forcing keeps the earlier holes on record.
    fn force_progress(&mut self, now_ms: u64, ready: &mut Vec<ReadyEvent>) {
        let Some((&min_seq, _)) = self.buffered.first_key_value() else {
            return;
        };
        let missing: Vec<EventSeq> = (self.cursor.applied.get() + 1..min_seq.get())
            .filter_map(EventSeq::new)
            .collect();
        for entry in self.buffered.values_mut() {
            entry.needs_reconciliation = true;
            entry.missing_seqs.extend(missing.iter().copied());
        }
        tracing::warn!(
            "workspace {} gap timed out; skipping {} missing sequence(s) {}..{} to resume at {}",
            self.cursor.workspace,
            missing.len(),
            self.cursor.applied.get() + 1,
            min_seq.get().saturating_sub(1),
            min_seq
        );
        self.cursor.applied = min_seq.prev_applied();
        self.total_forced += 1;
        self.gap_since_ms = Some(now_ms);
        self.drain_contiguous(now_ms, ready);
    }

    fn apply(
        &mut self,
        event: EventRecord,
        now_ms: u64,
        needs_reconciliation: bool,
        missing_seqs: Vec<EventSeq>,
        ready: &mut Vec<ReadyEvent>,
    ) {
        // Caller guarantees the event is at cursor + 1.
        self.cursor.applied = self.cursor.applied.next().into();
        self.cursor.last_event = Some(event.id);
        self.cursor.applied_at_ms = now_ms;
        ready.push(ReadyEvent {
            event,
            needs_reconciliation,
            missing_seqs,
        });
    }

    fn drain_contiguous(&mut self, now_ms: u64, ready: &mut Vec<ReadyEvent>) {
        let mut drained = 0usize;
        loop {
            let next = self.cursor.applied.next();
            let Some(entry) = self.buffered.remove(&next) else {
                break;
            };
            self.buffered_bytes = self.buffered_bytes.saturating_sub(entry.size);
            self.apply(
                entry.event,
                now_ms,
                entry.needs_reconciliation,
                entry.missing_seqs,
                ready,
            );
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(
                "workspace {} drained {drained} buffered event(s) up to {}",
                self.cursor.workspace,
                self.cursor.applied.get()
            );
        }
        if self.buffered.is_empty() {
            self.gap_since_ms = None;
        }
    }

    fn stats(&self, now_ms: u64) -> StreamStats {
        StreamStats {
            applied: self.cursor.applied.get(),
            next_expected: self.cursor.applied.next().get(),
            buffered_events: self.buffered.len(),
            buffered_bytes: self.buffered_bytes,
            last_apply_ms: self.cursor.applied_at_ms,
            stalled: self.is_stalled(now_ms),
            total_forced: self.total_forced,
        }
    }
}

/// Per-workspace stream registry. Streams are created lazily on first
/// ingest; each stream serializes behind its own mutex so slow partitions
/// do not block the rest.
pub struct GapTracker {
    streams: RwLock<HashMap<WorkspaceId, Arc<Mutex<StreamState>>>>,
    limits: Limits,
}

impl GapTracker {
    pub fn new(limits: Limits) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            limits,
        }
    }

    pub fn ingest(
        &self,
        event: EventRecord,
        now_ms: u64,
    ) -> Result<SequenceOutcome, EngineError> {
        let (Some(workspace), Some(seq)) = (event.workspace.clone(), event.partition_seq) else {
            return Err(EngineError::Unsequenced { id: event.id });
        };
        let stream = self.stream(&workspace, now_ms)?;
        let mut state = stream.lock().map_err(|_| EngineError::LockPoisoned)?;
        Ok(state.ingest(seq, event, now_ms))
    }

    /// Force progress on every stalled stream. Returns the released events
    /// grouped by workspace.
    pub fn sweep_stalled(
        &self,
        now_ms: u64,
    ) -> Result<Vec<(WorkspaceId, Vec<ReadyEvent>)>, EngineError> {
        let streams: Vec<(WorkspaceId, Arc<Mutex<StreamState>>)> = {
            let map = self.streams.read().map_err(|_| EngineError::LockPoisoned)?;
            map.iter().map(|(ws, s)| (ws.clone(), s.clone())).collect()
        };
        let mut released = Vec::new();
        for (workspace, stream) in streams {
            let mut state = stream.lock().map_err(|_| EngineError::LockPoisoned)?;
            if state.is_stalled(now_ms) {
                let mut ready = Vec::new();
                state.force_progress(now_ms, &mut ready);
                if !ready.is_empty() {
                    released.push((workspace, ready));
                }
            }
        }
        Ok(released)
    }

    pub fn stats(
        &self,
        workspace: &WorkspaceId,
        now_ms: u64,
    ) -> Result<Option<StreamStats>, EngineError> {
        let stream = {
            let map = self.streams.read().map_err(|_| EngineError::LockPoisoned)?;
            map.get(workspace).cloned()
        };
        let Some(stream) = stream else {
            return Ok(None);
        };
        let state = stream.lock().map_err(|_| EngineError::LockPoisoned)?;
        Ok(Some(state.stats(now_ms)))
    }

    pub fn cursor(&self, workspace: &WorkspaceId) -> Result<Option<PartitionCursor>, EngineError> {
        let stream = {
            let map = self.streams.read().map_err(|_| EngineError::LockPoisoned)?;
            map.get(workspace).cloned()
        };
        let Some(stream) = stream else {
            return Ok(None);
        };
        let state = stream.lock().map_err(|_| EngineError::LockPoisoned)?;
        Ok(Some(state.cursor.clone()))
    }

    /// Operator path: drop everything buffered and pin the cursor. Returns
    /// how many buffered events were discarded.
    pub fn reset(
        &self,
        workspace: &WorkspaceId,
        applied: AppliedSeq,
        now_ms: u64,
    ) -> Result<usize, EngineError> {
        let stream = self.stream(workspace, now_ms)?;
        let mut state = stream.lock().map_err(|_| EngineError::LockPoisoned)?;
        let dropped = state.buffered.len();
        state.buffered.clear();
        state.buffered_bytes = 0;
        state.gap_since_ms = None;
        state.cursor.applied = applied;
        state.cursor.last_event = None;
        state.cursor.applied_at_ms = now_ms;
        if dropped > 0 {
            tracing::warn!("workspace {workspace} reset dropped {dropped} buffered event(s)");
        }
        Ok(dropped)
    }

    fn stream(
        &self,
        workspace: &WorkspaceId,
        now_ms: u64,
    ) -> Result<Arc<Mutex<StreamState>>, EngineError> {
        {
            let map = self.streams.read().map_err(|_| EngineError::LockPoisoned)?;
            if let Some(stream) = map.get(workspace) {
                return Ok(stream.clone());
            }
        }
        let mut map = self.streams.write().map_err(|_| EngineError::LockPoisoned)?;
        let stream = map.entry(workspace.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(StreamState::new(
                workspace.clone(),
                &self.limits,
                now_ms,
            )))
        });
        Ok(stream.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::core::{checksum_of, BroadcastStatus, EventId, EventKind, EventStatus};

    use super::*;

    fn ws(name: &str) -> WorkspaceId {
        WorkspaceId::parse(name).expect("valid")
    }

    fn record(workspace: &WorkspaceId, seq: u64) -> EventRecord {
        let payload = Some(json!({"seq": seq}));
        EventRecord {
            id: EventId::generate(),
            kind: EventKind::NoteAppended,
            name: "note appended".into(),
            workspace: Some(workspace.clone()),
            origin_session: None,
            checksum: checksum_of(payload.as_ref()),
            payload,
            status: EventStatus::Pending,
            global_seq: EventSeq::new(seq).expect("nonzero"),
            partition_seq: Some(EventSeq::new(seq).expect("nonzero")),
            clock: None,
            idempotency_key: None,
            broadcast: BroadcastStatus::Pending,
            created_at_ms: 0,
            started_at_ms: None,
            completed_at_ms: None,
            duration_ms: None,
            result: None,
            error: None,
            last_applied: None,
        }
    }

    fn state(workspace: &WorkspaceId, limits: &Limits) -> StreamState {
        StreamState::new(workspace.clone(), limits, 0)
    }

    fn ingest(state: &mut StreamState, seq: u64, now_ms: u64) -> SequenceOutcome {
        let workspace = state.cursor.workspace.clone();
        let event = record(&workspace, seq);
        state.ingest(EventSeq::new(seq).expect("nonzero"), event, now_ms)
    }

    fn ready_seqs(ready: &[ReadyEvent]) -> Vec<u64> {
        ready
            .iter()
            .map(|r| r.event.partition_seq.expect("sequenced").get())
            .collect()
    }

    fn missing(ready: &ReadyEvent) -> Vec<u64> {
        ready.missing_seqs.iter().map(|s| s.get()).collect()
    }

    #[test]
    fn in_order_applies_immediately() {
        let limits = Limits::default();
        let mut state = state(&ws("ws1"), &limits);

        for seq in 1..=3u64 {
            let outcome = ingest(&mut state, seq, 100 + seq);
            assert_eq!(outcome.admission, Admission::Applied);
            assert_eq!(ready_seqs(&outcome.ready), vec![seq]);
            assert!(!outcome.ready[0].needs_reconciliation);
        }
        assert_eq!(state.cursor.applied.get(), 3);
        assert!(state.buffered.is_empty());
    }

    #[test]
    fn out_of_order_buffers_then_drains() {
        let limits = Limits::default();
        let mut state = state(&ws("ws1"), &limits);

        let outcome = ingest(&mut state, 1, 100);
        assert_eq!(outcome.admission, Admission::Applied);

        let outcome = ingest(&mut state, 3, 101);
        assert_eq!(
            outcome.admission,
            Admission::Buffered {
                want: EventSeq::new(2).expect("nonzero"),
                buffered: 1,
            }
        );
        assert!(outcome.ready.is_empty());
        assert!(state.gap_since_ms.is_some());

        let outcome = ingest(&mut state, 2, 102);
        assert_eq!(outcome.admission, Admission::Applied);
        assert_eq!(ready_seqs(&outcome.ready), vec![2, 3]);
        assert_eq!(state.cursor.applied.get(), 3);
        assert!(state.gap_since_ms.is_none());
        assert_eq!(state.buffered_bytes, 0);
    }

    #[test]
    fn duplicates_are_noops() {
        let limits = Limits::default();
        let mut state = state(&ws("ws1"), &limits);

        let _ = ingest(&mut state, 1, 100);
        let outcome = ingest(&mut state, 1, 101);
        assert!(matches!(outcome.admission, Admission::Duplicate { .. }));
        assert!(outcome.ready.is_empty());

        let _ = ingest(&mut state, 3, 102);
        let outcome = ingest(&mut state, 3, 103);
        assert!(matches!(outcome.admission, Admission::Duplicate { .. }));
        assert_eq!(state.buffered.len(), 1);
    }

    #[test]
    fn event_overflow_rejects() {
        let mut limits = Limits::default();
        limits.max_gap_buffer_events = 1;
        let mut state = state(&ws("ws1"), &limits);

        let _ = ingest(&mut state, 3, 100);
        let outcome = ingest(&mut state, 5, 100);
        assert_eq!(
            outcome.admission,
            Admission::Rejected(Overflow::Events {
                buffered: 1,
                max: 1
            })
        );
        assert!(!outcome.accepted());
        assert_eq!(state.buffered.len(), 1);
    }

    #[test]
    fn byte_overflow_rejects() {
        let mut limits = Limits::default();
        limits.max_gap_buffer_bytes = 8;
        let mut state = state(&ws("ws1"), &limits);

        let outcome = ingest(&mut state, 3, 100);
        assert!(matches!(
            outcome.admission,
            Admission::Rejected(Overflow::Bytes { .. })
        ));
        assert_eq!(state.buffered_bytes, 0);
    }

    #[test]
    fn forced_progress_releases_flagged_events() {
        let mut limits = Limits::default();
        limits.gap_timeout_ms = 30;
        let mut state = state(&ws("ws1"), &limits);

        let _ = ingest(&mut state, 1, 0);
        let _ = ingest(&mut state, 2, 1);
        let _ = ingest(&mut state, 5, 10);
        let _ = ingest(&mut state, 6, 11);

        assert!(!state.is_stalled(39));
        assert!(state.is_stalled(40));

        let mut ready = Vec::new();
        state.force_progress(41, &mut ready);
        assert_eq!(ready_seqs(&ready), vec![5, 6]);
        for event in &ready {
            assert!(event.needs_reconciliation);
            assert_eq!(missing(event), vec![3, 4]);
        }
        assert_eq!(state.cursor.applied.get(), 6);
        assert_eq!(state.total_forced, 1);
        assert!(state.gap_since_ms.is_none());
    }

    #[test]
    fn forced_progress_accumulates_missing_across_forcings() {
        let mut limits = Limits::default();
        limits.gap_timeout_ms = 30;
        let mut state = state(&ws("ws1"), &limits);

        let _ = ingest(&mut state, 1, 0);
        let _ = ingest(&mut state, 2, 1);
        let _ = ingest(&mut state, 5, 10);
        let _ = ingest(&mut state, 6, 11);
        let _ = ingest(&mut state, 9, 12);

        let mut ready = Vec::new();
        state.force_progress(45, &mut ready);
        assert_eq!(ready_seqs(&ready), vec![5, 6]);
        assert_eq!(state.cursor.applied.get(), 6);
        // 9 is still gapped behind 7 and 8; a fresh window starts.
        assert_eq!(state.gap_since_ms, Some(45));

        let mut ready = Vec::new();
        state.force_progress(90, &mut ready);
        assert_eq!(ready_seqs(&ready), vec![9]);
        assert_eq!(missing(&ready[0]), vec![3, 4, 7, 8]);
        assert_eq!(state.cursor.applied.get(), 9);
        assert_eq!(state.total_forced, 2);
    }

    #[test]
    fn stalled_stream_forces_before_classifying_arrival() {
        let mut limits = Limits::default();
        limits.gap_timeout_ms = 30;
        let mut state = state(&ws("ws1"), &limits);

        let _ = ingest(&mut state, 3, 0);
        let outcome = ingest(&mut state, 5, 60);
        assert_eq!(ready_seqs(&outcome.ready), vec![3]);
        assert_eq!(missing(&outcome.ready[0]), vec![1, 2]);
        assert_eq!(
            outcome.admission,
            Admission::Buffered {
                want: EventSeq::new(4).expect("nonzero"),
                buffered: 1,
            }
        );
    }

    #[test]
    fn late_arrival_after_forcing_is_a_duplicate() {
        let mut limits = Limits::default();
        limits.gap_timeout_ms = 30;
        let mut state = state(&ws("ws1"), &limits);

        let _ = ingest(&mut state, 3, 0);
        let outcome = ingest(&mut state, 1, 60);
        assert_eq!(ready_seqs(&outcome.ready), vec![3]);
        assert!(matches!(outcome.admission, Admission::Duplicate { .. }));
    }

    #[test]
    fn tracker_keeps_workspaces_independent() {
        let tracker = GapTracker::new(Limits::default());
        let ws_a = ws("alpha");
        let ws_b = ws("beta");

        let outcome = tracker.ingest(record(&ws_a, 1), 100).expect("ingest");
        assert_eq!(outcome.admission, Admission::Applied);
        let outcome = tracker.ingest(record(&ws_b, 2), 100).expect("ingest");
        assert!(matches!(outcome.admission, Admission::Buffered { .. }));

        let stats_a = tracker.stats(&ws_a, 100).expect("stats").expect("known");
        let stats_b = tracker.stats(&ws_b, 100).expect("stats").expect("known");
        assert_eq!(stats_a.applied, 1);
        assert_eq!(stats_a.buffered_events, 0);
        assert_eq!(stats_b.applied, 0);
        assert_eq!(stats_b.buffered_events, 1);
        assert!(tracker.stats(&ws("gamma"), 100).expect("stats").is_none());
    }

    #[test]
    fn tracker_sweep_forces_only_stalled_streams() {
        let mut limits = Limits::default();
        limits.gap_timeout_ms = 30;
        let tracker = GapTracker::new(limits);
        let ws_a = ws("alpha");
        let ws_b = ws("beta");

        let _ = tracker.ingest(record(&ws_a, 2), 0).expect("ingest");
        let _ = tracker.ingest(record(&ws_b, 2), 25).expect("ingest");

        let released = tracker.sweep_stalled(40).expect("sweep");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].0, ws_a);
        assert_eq!(ready_seqs(&released[0].1), vec![2]);
        assert_eq!(missing(&released[0].1[0]), vec![1]);

        let stats_b = tracker.stats(&ws_b, 40).expect("stats").expect("known");
        assert_eq!(stats_b.buffered_events, 1);
        assert_eq!(stats_b.total_forced, 0);
    }

    #[test]
    fn tracker_reset_drops_buffer_and_pins_cursor() {
        let tracker = GapTracker::new(Limits::default());
        let workspace = ws("alpha");

        let _ = tracker.ingest(record(&workspace, 5), 100).expect("ingest");
        let dropped = tracker
            .reset(&workspace, AppliedSeq::new(7), 200)
            .expect("reset");
        assert_eq!(dropped, 1);

        let stats = tracker.stats(&workspace, 200).expect("stats").expect("known");
        assert_eq!(stats.applied, 7);
        assert_eq!(stats.buffered_events, 0);

        let outcome = tracker.ingest(record(&workspace, 8), 201).expect("ingest");
        assert_eq!(outcome.admission, Admission::Applied);
    }

    #[test]
    fn unsequenced_event_is_refused() {
        let tracker = GapTracker::new(Limits::default());
        let mut event = record(&ws("alpha"), 1);
        event.partition_seq = None;
        let err = tracker.ingest(event, 100).expect_err("no sequence");
        assert!(matches!(err, EngineError::Unsequenced { .. }));
    }
}
