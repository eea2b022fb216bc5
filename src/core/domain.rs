//! Closed domain enumerations.
//!
//! Every enum here round-trips through its wire string via an `as_str`/`parse`
//! pair; parsing anything outside the closed set is a typed error, which is
//! what rejects unknown kinds at event creation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::CoreError;

/// The kinds of mutation the meeting domain produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventKind {
    MeetingCreated,
    MeetingUpdated,
    MeetingDeleted,
    TaskCreated,
    TaskUpdated,
    TaskCompleted,
    NoteAppended,
    TranscriptSegment,
    TranscriptFinalized,
    SummaryGenerated,
    MemberJoined,
    MemberLeft,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::MeetingCreated,
        EventKind::MeetingUpdated,
        EventKind::MeetingDeleted,
        EventKind::TaskCreated,
        EventKind::TaskUpdated,
        EventKind::TaskCompleted,
        EventKind::NoteAppended,
        EventKind::TranscriptSegment,
        EventKind::TranscriptFinalized,
        EventKind::SummaryGenerated,
        EventKind::MemberJoined,
        EventKind::MemberLeft,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::MeetingCreated => "meeting_created",
            EventKind::MeetingUpdated => "meeting_updated",
            EventKind::MeetingDeleted => "meeting_deleted",
            EventKind::TaskCreated => "task_created",
            EventKind::TaskUpdated => "task_updated",
            EventKind::TaskCompleted => "task_completed",
            EventKind::NoteAppended => "note_appended",
            EventKind::TranscriptSegment => "transcript_segment",
            EventKind::TranscriptFinalized => "transcript_finalized",
            EventKind::SummaryGenerated => "summary_generated",
            EventKind::MemberJoined => "member_joined",
            EventKind::MemberLeft => "member_left",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEventKind { raw: s.to_string() })
    }
}

/// Lifecycle state of an event record. Forward-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            _ => Err(CoreError::UnknownEventStatus { raw: s.to_string() }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }

    /// Legal forward transitions. A pending event may complete or fail
    /// without an explicit processing step.
    pub fn can_advance_to(self, next: EventStatus) -> bool {
        match self {
            EventStatus::Pending => matches!(
                next,
                EventStatus::Processing | EventStatus::Completed | EventStatus::Failed
            ),
            EventStatus::Processing => {
                matches!(next, EventStatus::Completed | EventStatus::Failed)
            }
            EventStatus::Completed | EventStatus::Failed => false,
        }
    }
}

/// Delivery state toward the real-time transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BroadcastStatus {
    Pending,
    Sent,
    Failed,
}

impl BroadcastStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastStatus::Pending => "pending",
            BroadcastStatus::Sent => "sent",
            BroadcastStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(BroadcastStatus::Pending),
            "sent" => Ok(BroadcastStatus::Sent),
            "failed" => Ok(BroadcastStatus::Failed),
            _ => Err(CoreError::UnknownBroadcastStatus { raw: s.to_string() }),
        }
    }
}

/// Policy for picking a winner between two causally-concurrent events.
///
/// A closed tagged union dispatched through exhaustive `match`, deliberately
/// not a string lookup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConflictStrategy {
    /// Smaller identity wins; server-originated events are allocated first.
    ServerWins,
    /// Larger identity wins.
    ClientWins,
    /// Later creation timestamp wins.
    #[default]
    LastWriteWins,
    /// Degrades to `LastWriteWins` and flags for manual follow-up.
    Merge,
    /// No automatic winner; both events flagged for operator review.
    Manual,
}

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 5] = [
        ConflictStrategy::ServerWins,
        ConflictStrategy::ClientWins,
        ConflictStrategy::LastWriteWins,
        ConflictStrategy::Merge,
        ConflictStrategy::Manual,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::LastWriteWins => "last_write_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| CoreError::UnknownConflictStrategy { raw: s.to_string() })
    }
}

macro_rules! wire_enum_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<String> for $ty {
            type Error = CoreError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                $ty::parse(&s)
            }
        }

        impl From<$ty> for String {
            fn from(v: $ty) -> String {
                v.as_str().to_string()
            }
        }
    };
}

wire_enum_impls!(EventKind);
wire_enum_impls!(EventStatus);
wire_enum_impls!(BroadcastStatus);
wire_enum_impls!(ConflictStrategy);
