#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use metronome::{EngineConfig, MemoryLedger, Sequencer, SqliteLedger};

/// Temporary directory holding one SQLite ledger for a test's lifetime.
///
/// The directory is removed on drop, so keep the fixture alive as long as
/// any sequencer opened from it.
pub struct TempLedgerDir {
    _temp: TempDir,
    dir: PathBuf,
}

impl TempLedgerDir {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let dir = temp.path().to_path_buf();
        Self { _temp: temp, dir }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join("events.db")
    }

    pub fn open_ledger(&self) -> SqliteLedger {
        SqliteLedger::open(self.db_path()).expect("open sqlite ledger")
    }
}

/// Default config with near-zero allocation backoff so retry paths do not
/// slow the suite down.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.limits.alloc_backoff_base_ms = 1;
    config
}

/// Config for tests that hammer one ledger from many threads. The memory
/// backend admits a single transaction at a time and refuses the rest, so
/// contended writers need more retry headroom than the default allows.
pub fn contended_config() -> EngineConfig {
    let mut config = fast_config();
    config.limits.max_alloc_retries = 32;
    config
}

pub fn memory_sequencer() -> Sequencer {
    memory_sequencer_with(fast_config())
}

pub fn memory_sequencer_with(config: EngineConfig) -> Sequencer {
    Sequencer::new(Arc::new(MemoryLedger::new()), config)
}

pub fn sqlite_sequencer(dir: &TempLedgerDir) -> Sequencer {
    sqlite_sequencer_with(dir, fast_config())
}

pub fn sqlite_sequencer_with(dir: &TempLedgerDir, config: EngineConfig) -> Sequencer {
    Sequencer::new(Arc::new(dir.open_ledger()), config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_dir_creates_fresh_database() {
        let dir = TempLedgerDir::new();
        assert!(!dir.db_path().exists());
        let _ledger = dir.open_ledger();
        assert!(dir.db_path().exists());
    }
}
