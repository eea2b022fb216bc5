//! Engine configuration and partial overrides.

use serde::{Deserialize, Serialize};

use crate::core::{ConflictStrategy, Limits};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Strategy used when a conflict is resolved without an explicit choice.
    pub default_strategy: ConflictStrategy,
    pub limits: Limits,
}

/// Sparse overlay for [`EngineConfig`], e.g. deserialized from an
/// environment- or tenant-provided blob. Absent fields leave the base value
/// alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfigOverride {
    pub default_strategy: Option<ConflictStrategy>,
    pub limits: LimitsOverride,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitsOverride {
    pub max_gap_buffer_events: Option<usize>,
    pub max_gap_buffer_bytes: Option<usize>,
    pub gap_timeout_ms: Option<u64>,
    pub max_alloc_retries: Option<u32>,
    pub alloc_backoff_base_ms: Option<u64>,
    pub max_broadcast_batch: Option<usize>,
}

impl EngineConfigOverride {
    pub fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(strategy) = self.default_strategy {
            config.default_strategy = strategy;
        }
        self.limits.apply_to(&mut config.limits);
    }
}

impl LimitsOverride {
    pub fn apply_to(&self, limits: &mut Limits) {
        if let Some(v) = self.max_gap_buffer_events {
            limits.max_gap_buffer_events = v;
        }
        if let Some(v) = self.max_gap_buffer_bytes {
            limits.max_gap_buffer_bytes = v;
        }
        if let Some(v) = self.gap_timeout_ms {
            limits.gap_timeout_ms = v;
        }
        if let Some(v) = self.max_alloc_retries {
            limits.max_alloc_retries = v;
        }
        if let Some(v) = self.alloc_backoff_base_ms {
            limits.alloc_backoff_base_ms = v;
        }
        if let Some(v) = self.max_broadcast_batch {
            limits.max_broadcast_batch = v;
        }
    }
}
