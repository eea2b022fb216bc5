//! Operational bounds.

use serde::{Deserialize, Serialize};

/// Tunable limits. All fields have serde defaults so a partial config file
/// only names what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Max events buffered per partition while waiting on a gap.
    pub max_gap_buffer_events: usize,
    /// Max approximate bytes buffered per partition.
    pub max_gap_buffer_bytes: usize,
    /// How long a partition may sit gapped with no applies before progress is
    /// forced.
    pub gap_timeout_ms: u64,
    /// Attempts for contended sequence allocation before giving up.
    pub max_alloc_retries: u32,
    /// Base of the jittered exponential backoff between allocation attempts.
    pub alloc_backoff_base_ms: u64,
    /// Upper clamp on one pending-broadcast query.
    pub max_broadcast_batch: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_gap_buffer_events: 512,
            max_gap_buffer_bytes: 8 * 1024 * 1024,
            gap_timeout_ms: 30_000,
            max_alloc_retries: 5,
            alloc_backoff_base_ms: 10,
            max_broadcast_batch: 256,
        }
    }
}
