//! Durable local storage: the key-value cache and the outbox.
//!
//! Both live behind traits so the coordinator and the accessors stay agnostic
//! of the storage engine. [`SqliteStore`] is the shipped implementation.

pub mod cache;
pub mod keys;
pub mod sqlite;

use chrono::Duration;
use serde_json::Value;
use thiserror::Error;

use crate::error::FailureReason;
use crate::outbox::{OutboxId, OutboxItem, OutboxOp};

pub use cache::{get_as, set_as, CacheEntry};
pub use sqlite::{DeadLetter, SqliteStore};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Local storage is full")]
    StorageFull,

    #[error("Storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn reason(&self) -> FailureReason {
        match self {
            StoreError::StorageFull => FailureReason::StorageFull,
            _ => FailureReason::Storage,
        }
    }
}

/// Persistent JSON values keyed by caller-chosen strings.
///
/// A missing key reads as `Value::Null`. Setting `Null` is a tombstone and is
/// distinct from never having set the key, which [`Cache::entry`] exposes.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Result<Value, StoreError>;

    /// The stored entry, or `None` if the key was never set (or deleted).
    fn entry(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Ordered durable log of mutations awaiting remote confirmation.
pub trait Outbox: Send + Sync {
    fn enqueue(&self, op: &OutboxOp) -> Result<OutboxId, StoreError>;

    /// Every pending item in insertion order.
    fn read_all(&self) -> Result<Vec<OutboxItem>, StoreError>;

    /// Remove one item. Removing an unknown id is a no-op.
    fn remove(&self, id: OutboxId) -> Result<(), StoreError>;

    /// Record a failed replay attempt and return the new attempt count.
    fn record_failure(&self, id: OutboxId, reason: &str) -> Result<u32, StoreError>;

    /// Move an item to the dead-letter state; it is no longer replayed.
    fn mark_failed(&self, id: OutboxId, reason: &str) -> Result<(), StoreError>;

    /// Dead-lettered items in insertion order.
    fn read_failed(&self) -> Result<Vec<OutboxItem>, StoreError>;

    /// Move a dead-lettered item back to pending. Returns false if no such
    /// dead-lettered item exists.
    fn requeue(&self, id: OutboxId) -> Result<bool, StoreError>;
}

/// Time-bounded named leases shared by every process using the same store.
pub trait Lease: Send + Sync {
    /// Take `name` for `holder` unless another holder has an unexpired lease.
    fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

    fn release(&self, name: &str, holder: &str) -> Result<(), StoreError>;
}

/// Everything the coordinator and the accessors need from storage.
pub trait Store: Cache + Outbox + Lease {}

impl<T: Cache + Outbox + Lease> Store for T {}
