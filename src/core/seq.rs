//! Sequence arithmetic for the two ordering spaces.
//!
//! Allocated numbers start at 1 and are `EventSeq`; a partition cursor starts
//! at 0 ("nothing applied yet") and is `AppliedSeq`. Keeping them as distinct
//! types makes the `L + 1` math in the gap buffer hard to get wrong.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// A 1-based allocated sequence number (global or partition-scoped).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSeq(NonZeroU64);

impl EventSeq {
    pub const FIRST: EventSeq = EventSeq(NonZeroU64::MIN);

    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    pub fn next(self) -> EventSeq {
        let next = self
            .0
            .get()
            .checked_add(1)
            .expect("sequence overflow computing next");
        EventSeq(NonZeroU64::new(next).expect("seq + 1 is nonzero"))
    }

    pub fn prev(self) -> Option<EventSeq> {
        NonZeroU64::new(self.0.get() - 1).map(EventSeq)
    }

    /// The cursor position for which this is the next applicable number.
    pub fn prev_applied(self) -> AppliedSeq {
        AppliedSeq(self.0.get() - 1)
    }
}

impl fmt::Debug for EventSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventSeq({})", self.0)
    }
}

impl fmt::Display for EventSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<EventSeq> for u64 {
    fn from(seq: EventSeq) -> u64 {
        seq.get()
    }
}

/// A 0-based cursor: the highest sequence applied so far, 0 when none.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AppliedSeq(u64);

impl AppliedSeq {
    pub const ZERO: AppliedSeq = AppliedSeq(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The next applicable sequence number after this cursor.
    pub fn next(self) -> EventSeq {
        let next = self
            .0
            .checked_add(1)
            .expect("cursor overflow computing next seq");
        EventSeq(NonZeroU64::new(next).expect("cursor + 1 is nonzero"))
    }

    /// True when `seq` is exactly the next contiguous number.
    pub fn is_next(self, seq: EventSeq) -> bool {
        seq.get() == self.0 + 1
    }
}

impl fmt::Debug for AppliedSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppliedSeq({})", self.0)
    }
}

impl fmt::Display for AppliedSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<EventSeq> for AppliedSeq {
    fn from(seq: EventSeq) -> AppliedSeq {
        AppliedSeq(seq.get())
    }
}
