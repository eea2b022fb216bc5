#![allow(dead_code)]

use serde_json::json;

use metronome::{
    ActorId, EventDraft, EventKind, EventSeq, IdempotencyKey, SessionId, WorkspaceId,
};

pub fn ws(seed: u8) -> WorkspaceId {
    WorkspaceId::parse(format!("ws-{seed:02}")).expect("valid workspace id")
}

pub fn actor(name: &str) -> ActorId {
    ActorId::parse(name).expect("valid actor id")
}

pub fn session(name: &str) -> SessionId {
    SessionId::parse(name).expect("valid session id")
}

pub fn idem(key: &str) -> IdempotencyKey {
    IdempotencyKey::parse(key).expect("valid idempotency key")
}

pub fn seq(n: u64) -> EventSeq {
    EventSeq::new(n).expect("nonzero sequence")
}

/// A transcript-segment draft targeting `workspace`, distinguishable by
/// `seed`.
pub fn segment_draft(workspace: &WorkspaceId, seed: u32) -> EventDraft {
    EventDraft::new(EventKind::TranscriptSegment, format!("segment-{seed}"))
        .in_workspace(workspace.clone())
        .with_payload(json!({
            "segment": seed,
            "text": format!("utterance {seed}"),
        }))
}

/// A task-update draft touching `resource`, authored by `author` with a
/// fresh clock. Conflict tests pit two of these against each other.
pub fn task_update_draft(workspace: &WorkspaceId, author: &str, resource: &str) -> EventDraft {
    EventDraft::new(EventKind::TaskUpdated, format!("update by {author}"))
        .in_workspace(workspace.clone())
        .by_actor(actor(author), None)
        .with_payload(json!({
            "resource_id": resource,
            "title": format!("{resource} edited by {author}"),
        }))
}
