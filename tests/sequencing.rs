//! Sequence allocation: gap-free partition numbering, monotonic global
//! numbering, idempotent replay, and contention between parallel writers.

use std::sync::Mutex;
use std::thread;

use metronome::engine::EngineError;
use metronome::{Error, EventDraft, EventKind, EventRecord, Sequencer, WorkspaceId};

mod fixtures;

use fixtures::events::{idem, segment_draft, ws};
use fixtures::ledger::{
    contended_config, memory_sequencer, memory_sequencer_with, sqlite_sequencer,
    sqlite_sequencer_with, TempLedgerDir,
};

#[test]
fn global_sequence_is_monotonic_across_workspaces() {
    let seq = memory_sequencer();
    let ws_a = ws(1);
    let ws_b = ws(2);

    let mut globals = Vec::new();
    for (workspace, n) in [(&ws_a, 0), (&ws_b, 0), (&ws_a, 1), (&ws_a, 2), (&ws_b, 1)] {
        let record = seq
            .create_event(segment_draft(workspace, n))
            .expect("create event")
            .into_record();
        globals.push(record.global_seq.get());
    }

    for pair in globals.windows(2) {
        assert!(pair[0] < pair[1], "global seq regressed: {globals:?}");
    }
}

#[test]
fn partition_sequences_start_at_one_with_no_holes() {
    let dir = TempLedgerDir::new();
    let seq = sqlite_sequencer(&dir);
    let workspace = ws(3);

    let seqs: Vec<u64> = (0..5)
        .map(|n| {
            seq.create_event(segment_draft(&workspace, n))
                .expect("create event")
                .record()
                .partition_seq
                .expect("workspace event is sequenced")
                .get()
        })
        .collect();

    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[test]
fn partitions_number_independently() {
    let seq = memory_sequencer();
    let ws_a = ws(4);
    let ws_b = ws(5);

    let a1 = create(&seq, &ws_a, 0);
    let b1 = create(&seq, &ws_b, 0);
    let a2 = create(&seq, &ws_a, 1);

    assert_eq!(partition_of(&a1), 1);
    assert_eq!(partition_of(&b1), 1);
    assert_eq!(partition_of(&a2), 2);
}

#[test]
fn workspaceless_events_take_global_numbers_only() {
    let seq = memory_sequencer();
    let digest = |text: &str| EventDraft::new(EventKind::SummaryGenerated, text);

    let first = seq
        .create_event(digest("cross-workspace digest"))
        .expect("create event")
        .into_record();
    let second = seq
        .create_event(digest("another digest"))
        .expect("create event")
        .into_record();

    assert!(first.workspace.is_none());
    assert!(first.partition_seq.is_none());
    assert!(second.partition_seq.is_none());
    assert!(first.global_seq < second.global_seq);
}

#[test]
fn parallel_writers_on_sqlite_leave_no_holes() {
    const WRITERS: u32 = 8;
    const PER_WRITER: u32 = 6;

    let dir = TempLedgerDir::new();
    let seq = sqlite_sequencer_with(&dir, contended_config());
    let workspace = ws(6);
    let records = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..WRITERS {
            scope.spawn(|| {
                for n in 0..PER_WRITER {
                    let record = seq
                        .create_event(segment_draft(&workspace, n))
                        .expect("create event under contention")
                        .into_record();
                    records.lock().expect("collect records").push(record);
                }
            });
        }
    });

    let records = records.into_inner().expect("collect records");
    assert_exact_partition(&records, u64::from(WRITERS * PER_WRITER));
}

#[test]
fn parallel_writers_on_memory_retry_through_the_gate() {
    const WRITERS: u32 = 4;
    const PER_WRITER: u32 = 8;

    let seq = memory_sequencer_with(contended_config());
    let workspace = ws(7);
    let records = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..WRITERS {
            scope.spawn(|| {
                for n in 0..PER_WRITER {
                    let record = seq
                        .create_event(segment_draft(&workspace, n))
                        .expect("create event under contention")
                        .into_record();
                    records.lock().expect("collect records").push(record);
                }
            });
        }
    });

    let records = records.into_inner().expect("collect records");
    assert_exact_partition(&records, u64::from(WRITERS * PER_WRITER));
}

#[test]
fn idempotent_resubmission_allocates_nothing() {
    let seq = memory_sequencer();
    let workspace = ws(8);
    let draft = segment_draft(&workspace, 0).idempotent(idem("segment-0-once"));

    let first = seq.create_event(draft.clone()).expect("first submission");
    assert!(!first.is_replay());

    let replay = seq.create_event(draft).expect("replayed submission");
    assert!(replay.is_replay());
    assert_eq!(replay.record().id, first.record().id);
    assert_eq!(replay.record().global_seq, first.record().global_seq);
    assert_eq!(replay.record().partition_seq, first.record().partition_seq);

    // The replay must not have burned a sequence number.
    let next = create(&seq, &workspace, 1);
    assert_eq!(partition_of(&next), 2);
}

#[test]
fn idempotent_replay_with_different_payload_is_refused() {
    let seq = memory_sequencer();
    let workspace = ws(9);
    let key = idem("segment-keyed");

    seq.create_event(segment_draft(&workspace, 0).idempotent(key.clone()))
        .expect("first submission");

    let err = seq
        .create_event(segment_draft(&workspace, 1).idempotent(key))
        .expect_err("same key, different payload");
    assert!(matches!(
        err,
        Error::Engine(EngineError::IdempotentReplayMismatch { .. })
    ));
}

#[test]
fn sequences_continue_across_reopen() {
    let dir = TempLedgerDir::new();
    let workspace = ws(10);

    {
        let seq = sqlite_sequencer(&dir);
        for n in 0..3 {
            create(&seq, &workspace, n);
        }
    }

    let seq = sqlite_sequencer(&dir);
    let record = create(&seq, &workspace, 3);
    assert_eq!(partition_of(&record), 4);
}

fn create(seq: &Sequencer, workspace: &WorkspaceId, n: u32) -> EventRecord {
    seq.create_event(segment_draft(workspace, n))
        .expect("create event")
        .into_record()
}

fn partition_of(record: &EventRecord) -> u64 {
    record
        .partition_seq
        .expect("workspace event is sequenced")
        .get()
}

/// Every partition sequence from 1 to `expected` present exactly once, and
/// all global sequences distinct.
fn assert_exact_partition(records: &[EventRecord], expected: u64) {
    let mut partition: Vec<u64> = records.iter().map(partition_of).collect();
    partition.sort_unstable();
    let want: Vec<u64> = (1..=expected).collect();
    assert_eq!(partition, want, "partition sequence has holes or duplicates");

    let mut globals: Vec<u64> = records.iter().map(|r| r.global_seq.get()).collect();
    globals.sort_unstable();
    globals.dedup();
    assert_eq!(globals.len(), records.len(), "global sequence reused");
}
