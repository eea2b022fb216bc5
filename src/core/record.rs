//! Event records and partition cursors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    checksum_of, ActorId, AppliedSeq, BroadcastStatus, Checksum, EventId, EventKind, EventSeq,
    EventStatus, IdempotencyKey, SessionId, VectorClock, WorkspaceId,
};

/// Caller-supplied fields for a new event, before stamping and allocation.
#[derive(Clone, Debug)]
pub struct EventDraft {
    pub kind: EventKind,
    pub name: String,
    pub payload: Option<Value>,
    pub workspace: Option<WorkspaceId>,
    pub origin_session: Option<SessionId>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub actor: Option<ActorId>,
    pub prior_clock: Option<VectorClock>,
}

impl EventDraft {
    pub fn new(kind: EventKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            payload: None,
            workspace: None,
            origin_session: None,
            idempotency_key: None,
            actor: None,
            prior_clock: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn in_workspace(mut self, workspace: WorkspaceId) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn from_session(mut self, session: SessionId) -> Self {
        self.origin_session = Some(session);
        self
    }

    pub fn idempotent(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    /// Attribute the event to `actor`, advancing from `prior_clock` when the
    /// caller has observed one.
    pub fn by_actor(mut self, actor: ActorId, prior_clock: Option<VectorClock>) -> Self {
        self.actor = Some(actor);
        self.prior_clock = prior_clock;
        self
    }
}

/// One sequenced mutation. Immutable once completed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub kind: EventKind,
    pub name: String,
    pub workspace: Option<WorkspaceId>,
    pub origin_session: Option<SessionId>,
    pub payload: Option<Value>,
    pub status: EventStatus,
    /// Unique and strictly increasing system-wide. Audit ordering only.
    pub global_seq: EventSeq,
    /// Unique and strictly increasing within `workspace`, starting at 1.
    /// Absent when the event has no workspace.
    pub partition_seq: Option<EventSeq>,
    pub checksum: Checksum,
    pub clock: Option<VectorClock>,
    pub idempotency_key: Option<IdempotencyKey>,
    pub broadcast: BroadcastStatus,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Set on completion to the event's own identity.
    pub last_applied: Option<EventId>,
}

impl EventRecord {
    /// Recompute the payload digest and compare with the stamped one.
    pub fn verify_checksum(&self) -> bool {
        checksum_of(self.payload.as_ref()) == self.checksum
    }

    /// Rough in-memory footprint, used for gap-buffer byte accounting.
    pub fn approx_size(&self) -> usize {
        let payload = self
            .payload
            .as_ref()
            .and_then(|v| serde_json::to_vec(v).ok())
            .map(|b| b.len())
            .unwrap_or(0);
        96 + self.name.len() + payload
    }
}

/// Last-applied position for one workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCursor {
    pub workspace: WorkspaceId,
    /// Highest partition sequence applied so far; 0 when none.
    pub applied: AppliedSeq,
    pub last_event: Option<EventId>,
    /// Time of the last successful application (stream creation time before
    /// anything has applied).
    pub applied_at_ms: u64,
}

impl PartitionCursor {
    pub fn new(workspace: WorkspaceId, now_ms: u64) -> Self {
        Self {
            workspace,
            applied: AppliedSeq::ZERO,
            last_event: None,
            applied_at_ms: now_ms,
        }
    }
}
