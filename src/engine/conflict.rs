//! Concurrent-edit detection and deterministic resolution.
//!
//! Causality comes from the event vector clocks; anything `Concurrent` is a
//! conflict. Resolution normalizes the pair by event id first, so callers get
//! the same answer whichever way round they pass the events. Version 7 event
//! ids are creation-ordered, which makes the lower id the earlier-accepted
//! side of the pair.

use serde::Serialize;

use crate::core::{Causality, ConflictStrategy, EventId, EventRecord};

/// Two concurrently-edited events, lower id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConflictPair {
    pub first: EventId,
    pub second: EventId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictOutcome {
    pub strategy: ConflictStrategy,
    /// `None` when the strategy defers the decision to a human.
    pub winner: Option<EventId>,
    pub needs_review: bool,
    /// Events that must be surfaced for review, lower id first.
    pub flagged: Vec<EventId>,
}

pub fn resolve_conflict(
    a: &EventRecord,
    b: &EventRecord,
    strategy: ConflictStrategy,
) -> ConflictOutcome {
    let (lo, hi) = if a.id <= b.id { (a, b) } else { (b, a) };
    match strategy {
        ConflictStrategy::ServerWins => decided(strategy, lo.id),
        ConflictStrategy::ClientWins => decided(strategy, hi.id),
        ConflictStrategy::LastWriteWins => decided(strategy, last_write(lo, hi)),
        ConflictStrategy::Merge => {
            tracing::warn!(
                "merge strategy degrades to last-write-wins for events {} and {}",
                lo.id,
                hi.id
            );
            ConflictOutcome {
                strategy,
                winner: Some(last_write(lo, hi)),
                needs_review: true,
                flagged: vec![lo.id, hi.id],
            }
        }
        ConflictStrategy::Manual => ConflictOutcome {
            strategy,
            winner: None,
            needs_review: true,
            flagged: vec![lo.id, hi.id],
        },
    }
}

/// Pairwise scan for concurrent clocks. Events without a clock never
/// conflict. With a resource filter, only events whose payload carries that
/// `resource_id` are considered.
pub fn detect_conflicts(events: &[EventRecord], resource: Option<&str>) -> Vec<ConflictPair> {
    let candidates: Vec<&EventRecord> = events
        .iter()
        .filter(|e| e.clock.is_some())
        .filter(|e| resource.map_or(true, |r| resource_of(e) == Some(r)))
        .collect();

    let mut pairs = Vec::new();
    for (i, a) in candidates.iter().enumerate() {
        for b in &candidates[i + 1..] {
            let (Some(clock_a), Some(clock_b)) = (&a.clock, &b.clock) else {
                continue;
            };
            if clock_a.compare(clock_b) == Causality::Concurrent {
                let (first, second) = if a.id <= b.id {
                    (a.id, b.id)
                } else {
                    (b.id, a.id)
                };
                pairs.push(ConflictPair { first, second });
            }
        }
    }
    pairs
}

fn decided(strategy: ConflictStrategy, winner: EventId) -> ConflictOutcome {
    ConflictOutcome {
        strategy,
        winner: Some(winner),
        needs_review: false,
        flagged: Vec::new(),
    }
}

/// Later wall-clock write wins; a tie goes to the higher (later-created) id.
fn last_write(lo: &EventRecord, hi: &EventRecord) -> EventId {
    if hi.created_at_ms >= lo.created_at_ms {
        hi.id
    } else {
        lo.id
    }
}

fn resource_of(event: &EventRecord) -> Option<&str> {
    event.payload.as_ref()?.get("resource_id")?.as_str()
}
