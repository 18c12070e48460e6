//! SQLite implementation of the cache, the outbox and the leases.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Cache, CacheEntry, Lease, Outbox, StoreError};
use crate::outbox::{OpKind, OutboxId, OutboxItem, OutboxOp};

/// How long a writer waits on a database locked by another process.
const BUSY_TIMEOUT_SECS: u64 = 5;

const STATUS_PENDING: &str = "pending";
const STATUS_FAILED: &str = "failed";

/// Schema for cache, outbox and lease tables.
const SCHEMA: &str = r#"
-- Last-known-good values keyed by caller-defined strings
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Mutations awaiting remote confirmation; AUTOINCREMENT keeps ids monotonic
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, id);

-- Cross-process pass leases
CREATE TABLE IF NOT EXISTS leases (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

/// SQLite-backed store. One connection, serialized behind a mutex, so
/// operations on the same key apply in call order.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(classify)?;
        conn.busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS))
            .map_err(classify)?;
        // Readers in other processes must not block the writer
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(classify)?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened store");

        Self::with_connection(conn)
    }

    /// A private, non-durable store. Used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(classify)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Number of pending outbox items per kind.
    pub fn pending_counts(&self) -> Result<Vec<(OpKind, usize)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT kind, COUNT(*) FROM outbox WHERE status = ?1 GROUP BY kind")
            .map_err(classify)?;
        let rows = stmt
            .query_map(params![STATUS_PENDING], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(classify)?;

        let mut counts = Vec::new();
        for row in rows {
            let (kind, count) = row.map_err(classify)?;
            if let Some(kind) = OpKind::parse(&kind) {
                counts.push((kind, count as usize));
            }
        }
        counts.sort_by_key(|(kind, _)| kind.precedence());
        Ok(counts)
    }

    /// Every dead-lettered row, including rows whose payload no longer
    /// decodes.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        Ok(self
            .read_raw(STATUS_FAILED)?
            .into_iter()
            .map(|raw| DeadLetter {
                id: OutboxId(raw.id),
                kind: raw.kind,
                created_at: raw.created_at,
                attempts: raw.attempts,
                last_error: raw.last_error,
            })
            .collect())
    }

    fn read_raw(&self, status: &str) -> Result<Vec<RawItem>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, payload, created_at, attempts, last_error FROM outbox
                 WHERE status = ?1
                 ORDER BY id",
            )
            .map_err(classify)?;

        let rows = stmt
            .query_map(params![status], |row| {
                Ok(RawItem {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    payload: row.get(2)?,
                    created_at: row.get(3)?,
                    attempts: row.get(4)?,
                    last_error: row.get(5)?,
                })
            })
            .map_err(classify)?;
        let raws = rows.collect::<Result<Vec<_>, _>>().map_err(classify)?;
        Ok(raws)
    }

    fn read_status(&self, status: &str) -> Result<Vec<OutboxItem>, StoreError> {
        let mut items = Vec::new();
        for raw in self.read_raw(status)? {
            match raw.decode() {
                Ok(item) => items.push(item),
                Err(e) if status == STATUS_PENDING => {
                    // It can never replay; park it where `dead_letters` shows it
                    warn!(
                        id = raw.id,
                        kind = %raw.kind,
                        error = %e,
                        "Dead-lettering undecodable outbox row"
                    );
                    let reason = format!("Undecodable outbox row: {}", e);
                    self.mark_failed(OutboxId(raw.id), &reason)?;
                }
                Err(e) => warn!(
                    id = raw.id,
                    kind = %raw.kind,
                    error = %e,
                    "Skipping undecodable outbox row"
                ),
            }
        }
        Ok(items)
    }
}

/// A dead-lettered outbox row as stored, payload left undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: OutboxId,
    pub kind: String,
    /// Epoch milliseconds at enqueue time.
    pub created_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

struct RawItem {
    id: i64,
    kind: String,
    payload: String,
    created_at: i64,
    attempts: u32,
    last_error: Option<String>,
}

impl RawItem {
    fn decode(&self) -> Result<OutboxItem, String> {
        let kind = OpKind::parse(&self.kind)
            .ok_or_else(|| format!("unknown kind {}", self.kind))?;
        let payload: Value = serde_json::from_str(&self.payload).map_err(|e| e.to_string())?;
        let op = OutboxOp::from_parts(kind, payload).map_err(|e| e.to_string())?;
        Ok(OutboxItem {
            id: OutboxId(self.id),
            op,
            created_at: self.created_at,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        })
    }
}

/// Map SQLite's "database or disk is full" to its own variant.
fn classify(e: rusqlite::Error) -> StoreError {
    if e.sqlite_error_code() == Some(ErrorCode::DiskFull) {
        StoreError::StorageFull
    } else {
        StoreError::Sqlite(e)
    }
}

impl Cache for SqliteStore {
    fn get(&self, key: &str) -> Result<Value, StoreError> {
        Ok(self.entry(key)?.map(|e| e.value).unwrap_or(Value::Null))
    }

    fn entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT value, updated_at FROM cache_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(classify)?;

        let Some((value, updated_at)) = row else {
            return Ok(None);
        };

        let value: Value = serde_json::from_str(&value)?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value,
            updated_at,
        }))
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let data = serde_json::to_string(value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cache_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, data, Utc::now().to_rfc3339()],
        )
        .map_err(classify)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            .map_err(classify)?;
        Ok(())
    }
}

impl Outbox for SqliteStore {
    fn enqueue(&self, op: &OutboxOp) -> Result<OutboxId, StoreError> {
        let payload = serde_json::to_string(&op.payload()?)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO outbox (kind, payload, created_at, status) VALUES (?1, ?2, ?3, ?4)",
            params![
                op.kind().as_str(),
                payload,
                Utc::now().timestamp_millis(),
                STATUS_PENDING
            ],
        )
        .map_err(classify)?;
        let id = OutboxId(conn.last_insert_rowid());
        debug!(%id, kind = %op.kind(), "Enqueued outbox item");
        Ok(id)
    }

    fn read_all(&self) -> Result<Vec<OutboxItem>, StoreError> {
        self.read_status(STATUS_PENDING)
    }

    fn remove(&self, id: OutboxId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM outbox WHERE id = ?1", params![id.0])
            .map_err(classify)?;
        Ok(())
    }

    fn record_failure(&self, id: OutboxId, reason: &str) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![id.0, reason],
        )
        .map_err(classify)?;
        let attempts: Option<u32> = conn
            .query_row(
                "SELECT attempts FROM outbox WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(classify)?;
        Ok(attempts.unwrap_or(0))
    }

    fn mark_failed(&self, id: OutboxId, reason: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE outbox SET status = ?2, last_error = ?3 WHERE id = ?1",
            params![id.0, STATUS_FAILED, reason],
        )
        .map_err(classify)?;
        Ok(())
    }

    fn read_failed(&self) -> Result<Vec<OutboxItem>, StoreError> {
        self.read_status(STATUS_FAILED)
    }

    fn requeue(&self, id: OutboxId) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE outbox SET status = ?2, attempts = 0 WHERE id = ?1 AND status = ?3",
                params![id.0, STATUS_PENDING, STATUS_FAILED],
            )
            .map_err(classify)?;
        Ok(changed > 0)
    }
}

impl Lease for SqliteStore {
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.num_milliseconds();
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE leases.holder = excluded.holder OR leases.expires_at <= ?4",
                params![name, holder, expires_at, now],
            )
            .map_err(classify)?;
        Ok(changed > 0)
    }

    fn release(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM leases WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )
        .map_err(classify)?;
        Ok(())
    }
}
