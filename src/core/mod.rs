//! Domain values shared by every layer: identities, sequence numbers, closed
//! enumerations, logical clocks, checksums, records, and limits.

mod checksum;
mod clock;
mod domain;
mod error;
mod identity;
mod json_canon;
mod limits;
mod record;
mod seq;
mod time;

pub use checksum::{checksum_of, sentinel_checksum, Checksum};
pub use clock::{Causality, VectorClock};
pub use domain::{BroadcastStatus, ConflictStrategy, EventKind, EventStatus};
pub use error::{CoreError, InvalidId};
pub use identity::{ActorId, EventId, IdempotencyKey, SessionId, WorkspaceId};
pub use json_canon::{to_canon_json_bytes, CanonJsonError};
pub use limits::Limits;
pub use record::{EventDraft, EventRecord, PartitionCursor};
pub use seq::{AppliedSeq, EventSeq};
pub use time::WallClock;
