//! SQLite-backed ledger.
//!
//! One connection behind a mutex; transactions open `BEGIN IMMEDIATE` so the
//! write lock is taken up front and every max-seq read inside a transaction
//! sees the latest committed allocation. Uniqueness constraints on the
//! sequence columns are the race detector: violations are classified into
//! typed duplicate errors the engine can retry.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::{
    BroadcastStatus, Checksum, EventId, EventKind, EventRecord, EventSeq, EventStatus,
    IdempotencyKey, SessionId, VectorClock, WorkspaceId,
};

use super::{Ledger, LedgerError, LedgerReader, LedgerTxn, LedgerWriter};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id                TEXT PRIMARY KEY,
    kind              TEXT NOT NULL,
    name              TEXT NOT NULL,
    workspace_id      TEXT,
    origin_session_id TEXT,
    payload           TEXT,
    status            TEXT NOT NULL,
    global_seq        INTEGER NOT NULL UNIQUE,
    partition_seq     INTEGER,
    checksum          TEXT NOT NULL,
    clock             TEXT,
    idempotency_key   TEXT UNIQUE,
    broadcast_status  TEXT NOT NULL,
    created_at_ms     INTEGER NOT NULL,
    started_at_ms     INTEGER,
    completed_at_ms   INTEGER,
    duration_ms       INTEGER,
    result            TEXT,
    error             TEXT,
    last_applied_id   TEXT,
    UNIQUE (workspace_id, partition_seq)
);
CREATE INDEX IF NOT EXISTS idx_events_broadcast
    ON events (broadcast_status, status, global_seq);
CREATE INDEX IF NOT EXISTS idx_events_workspace
    ON events (workspace_id, partition_seq);
";

const EVENT_COLUMNS: &str = "id, kind, name, workspace_id, origin_session_id, payload, status, \
     global_seq, partition_seq, checksum, clock, idempotency_key, broadcast_status, \
     created_at_ms, started_at_ms, completed_at_ms, duration_ms, result, error, last_applied_id";

#[derive(Debug)]
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        reject_symlink(path)?;
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        ensure_permissions(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }
}

impl Ledger for SqliteLedger {
    fn writer(&self) -> &dyn LedgerWriter {
        self
    }

    fn reader(&self) -> &dyn LedgerReader {
        self
    }
}

impl LedgerWriter for SqliteLedger {
    fn begin_txn(&self) -> Result<Box<dyn LedgerTxn + '_>, LedgerError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTxn {
            conn,
            committed: false,
        }))
    }
}

impl LedgerReader for SqliteLedger {
    fn fetch(&self, id: &EventId) -> Result<Option<EventRecord>, LedgerError> {
        fetch_event(&*self.lock()?, id)
    }

    fn max_global_seq(&self) -> Result<u64, LedgerError> {
        max_global_seq(&*self.lock()?)
    }

    fn max_partition_seq(&self, workspace: &WorkspaceId) -> Result<u64, LedgerError> {
        max_partition_seq(&*self.lock()?, workspace)
    }

    fn pending_broadcast(&self, limit: usize) -> Result<Vec<EventRecord>, LedgerError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE status = 'completed' AND broadcast_status = 'pending' \
             ORDER BY global_seq ASC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], read_raw)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(decode_event(raw?)?);
        }
        Ok(out)
    }
}

struct SqliteTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    committed: bool,
}

impl LedgerTxn for SqliteTxn<'_> {
    fn max_global_seq(&mut self) -> Result<u64, LedgerError> {
        max_global_seq(&self.conn)
    }

    fn max_partition_seq(&mut self, workspace: &WorkspaceId) -> Result<u64, LedgerError> {
        max_partition_seq(&self.conn, workspace)
    }

    fn fetch(&mut self, id: &EventId) -> Result<Option<EventRecord>, LedgerError> {
        fetch_event(&self.conn, id)
    }

    fn find_idempotent(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<Option<EventRecord>, LedgerError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE idempotency_key = ?1");
        let raw = self
            .conn
            .query_row(&sql, params![key.as_str()], read_raw)
            .optional()?;
        raw.map(decode_event).transpose()
    }

    fn insert_event(&mut self, record: &EventRecord) -> Result<(), LedgerError> {
        let payload = encode_json(record.payload.as_ref())?;
        let clock = encode_json(record.clock.as_ref())?;
        let result = encode_json(record.result.as_ref())?;
        let outcome = self.conn.execute(
            "INSERT INTO events (id, kind, name, workspace_id, origin_session_id, payload, \
             status, global_seq, partition_seq, checksum, clock, idempotency_key, \
             broadcast_status, created_at_ms, started_at_ms, completed_at_ms, duration_ms, \
             result, error, last_applied_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20)",
            params![
                record.id.to_string(),
                record.kind.as_str(),
                record.name,
                record.workspace.as_ref().map(|w| w.as_str()),
                record.origin_session.as_ref().map(|s| s.as_str()),
                payload,
                record.status.as_str(),
                seq_to_sql(record.global_seq.get())?,
                record
                    .partition_seq
                    .map(|s| seq_to_sql(s.get()))
                    .transpose()?,
                record.checksum.as_str(),
                clock,
                record.idempotency_key.as_ref().map(|k| k.as_str()),
                record.broadcast.as_str(),
                seq_to_sql(record.created_at_ms)?,
                record.started_at_ms.map(seq_to_sql).transpose()?,
                record.completed_at_ms.map(seq_to_sql).transpose()?,
                record.duration_ms.map(seq_to_sql).transpose()?,
                result,
                record.error.as_deref(),
                record.last_applied.map(|id| id.to_string()),
            ],
        );
        match outcome {
            Ok(_) => Ok(()),
            Err(err) => Err(classify_insert_err(err, record)),
        }
    }

    fn update_event(&mut self, record: &EventRecord) -> Result<(), LedgerError> {
        let result = encode_json(record.result.as_ref())?;
        let changed = self.conn.execute(
            "UPDATE events SET status = ?2, broadcast_status = ?3, started_at_ms = ?4, \
             completed_at_ms = ?5, duration_ms = ?6, result = ?7, error = ?8, \
             last_applied_id = ?9 WHERE id = ?1",
            params![
                record.id.to_string(),
                record.status.as_str(),
                record.broadcast.as_str(),
                record.started_at_ms.map(seq_to_sql).transpose()?,
                record.completed_at_ms.map(seq_to_sql).transpose()?,
                record.duration_ms.map(seq_to_sql).transpose()?,
                result,
                record.error.as_deref(),
                record.last_applied.map(|id| id.to_string()),
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound { id: record.id });
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), LedgerError> {
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), LedgerError> {
        self.conn.execute_batch("ROLLBACK")?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for SqliteTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

fn max_global_seq(conn: &Connection) -> Result<u64, LedgerError> {
    let max: i64 = conn.query_row("SELECT COALESCE(MAX(global_seq), 0) FROM events", [], |r| {
        r.get(0)
    })?;
    u64_col("global_seq", max)
}

fn max_partition_seq(conn: &Connection, workspace: &WorkspaceId) -> Result<u64, LedgerError> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(partition_seq), 0) FROM events WHERE workspace_id = ?1",
        params![workspace.as_str()],
        |r| r.get(0),
    )?;
    u64_col("partition_seq", max)
}

fn fetch_event(conn: &Connection, id: &EventId) -> Result<Option<EventRecord>, LedgerError> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1");
    let raw = conn
        .query_row(&sql, params![id.to_string()], read_raw)
        .optional()?;
    raw.map(decode_event).transpose()
}

/// Column values as stored, before domain decoding.
struct RawEvent {
    id: String,
    kind: String,
    name: String,
    workspace: Option<String>,
    origin_session: Option<String>,
    payload: Option<String>,
    status: String,
    global_seq: i64,
    partition_seq: Option<i64>,
    checksum: String,
    clock: Option<String>,
    idempotency_key: Option<String>,
    broadcast: String,
    created_at_ms: i64,
    started_at_ms: Option<i64>,
    completed_at_ms: Option<i64>,
    duration_ms: Option<i64>,
    result: Option<String>,
    error: Option<String>,
    last_applied: Option<String>,
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        workspace: row.get(3)?,
        origin_session: row.get(4)?,
        payload: row.get(5)?,
        status: row.get(6)?,
        global_seq: row.get(7)?,
        partition_seq: row.get(8)?,
        checksum: row.get(9)?,
        clock: row.get(10)?,
        idempotency_key: row.get(11)?,
        broadcast: row.get(12)?,
        created_at_ms: row.get(13)?,
        started_at_ms: row.get(14)?,
        completed_at_ms: row.get(15)?,
        duration_ms: row.get(16)?,
        result: row.get(17)?,
        error: row.get(18)?,
        last_applied: row.get(19)?,
    })
}

fn decode_event(raw: RawEvent) -> Result<EventRecord, LedgerError> {
    let global_seq = EventSeq::new(u64_col("global_seq", raw.global_seq)?)
        .ok_or_else(|| corrupt("global_seq", "zero"))?;
    let partition_seq = raw
        .partition_seq
        .map(|s| {
            EventSeq::new(u64_col("partition_seq", s)?).ok_or_else(|| corrupt("partition_seq", "zero"))
        })
        .transpose()?;
    Ok(EventRecord {
        id: EventId::parse(&raw.id).map_err(|e| corrupt("id", e))?,
        kind: EventKind::parse(&raw.kind).map_err(|e| corrupt("kind", e))?,
        name: raw.name,
        workspace: raw
            .workspace
            .map(WorkspaceId::parse)
            .transpose()
            .map_err(|e| corrupt("workspace_id", e))?,
        origin_session: raw
            .origin_session
            .map(SessionId::parse)
            .transpose()
            .map_err(|e| corrupt("origin_session_id", e))?,
        payload: raw
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("payload", e))?,
        status: EventStatus::parse(&raw.status).map_err(|e| corrupt("status", e))?,
        global_seq,
        partition_seq,
        checksum: Checksum::parse(raw.checksum).map_err(|e| corrupt("checksum", e))?,
        clock: raw
            .clock
            .as_deref()
            .map(serde_json::from_str::<VectorClock>)
            .transpose()
            .map_err(|e| corrupt("clock", e))?,
        idempotency_key: raw
            .idempotency_key
            .map(IdempotencyKey::parse)
            .transpose()
            .map_err(|e| corrupt("idempotency_key", e))?,
        broadcast: BroadcastStatus::parse(&raw.broadcast).map_err(|e| corrupt("broadcast_status", e))?,
        created_at_ms: u64_col("created_at_ms", raw.created_at_ms)?,
        started_at_ms: raw
            .started_at_ms
            .map(|v| u64_col("started_at_ms", v))
            .transpose()?,
        completed_at_ms: raw
            .completed_at_ms
            .map(|v| u64_col("completed_at_ms", v))
            .transpose()?,
        duration_ms: raw
            .duration_ms
            .map(|v| u64_col("duration_ms", v))
            .transpose()?,
        result: raw
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("result", e))?,
        error: raw.error,
        last_applied: raw
            .last_applied
            .as_deref()
            .map(EventId::parse)
            .transpose()
            .map_err(|e| corrupt("last_applied_id", e))?,
    })
}

fn encode_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, LedgerError> {
    value
        .map(|v| serde_json::to_string(v).map_err(LedgerError::Encode))
        .transpose()
}

fn seq_to_sql(value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value).map_err(|_| corrupt("integer column", "exceeds storage range"))
}

fn u64_col(what: &'static str, value: i64) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| corrupt(what, "negative"))
}

fn corrupt(what: &'static str, reason: impl ToString) -> LedgerError {
    LedgerError::Corrupt {
        what,
        reason: reason.to_string(),
    }
}

/// Substring checks ordered so `events.id` cannot shadow the longer names.
fn classify_insert_err(err: rusqlite::Error, record: &EventRecord) -> LedgerError {
    if let rusqlite::Error::SqliteFailure(e, Some(msg)) = &err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation {
            if msg.contains("events.idempotency_key") {
                if let Some(key) = &record.idempotency_key {
                    return LedgerError::DuplicateIdempotencyKey { key: key.clone() };
                }
            } else if msg.contains("events.partition_seq") {
                if let (Some(workspace), Some(seq)) = (&record.workspace, record.partition_seq) {
                    return LedgerError::DuplicatePartitionSeq {
                        workspace: workspace.clone(),
                        seq: seq.get(),
                    };
                }
            } else if msg.contains("events.global_seq") {
                return LedgerError::DuplicateGlobalSeq {
                    seq: record.global_seq.get(),
                };
            } else if msg.contains("events.id") {
                return LedgerError::DuplicateEventId { id: record.id };
            }
        }
    }
    LedgerError::Sqlite(err)
}

fn reject_symlink(path: &Path) -> Result<(), LedgerError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(LedgerError::SymlinkPath {
            path: PathBuf::from(path),
        }),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn ensure_permissions(path: &Path) -> Result<(), LedgerError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn ensure_permissions(_path: &Path) -> Result<(), LedgerError> {
    Ok(())
}
