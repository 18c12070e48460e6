//! fieldsync core - offline-first persistence and synchronization.
//!
//! This crate keeps an application usable while its hosted backend is out of
//! reach and reconciles once connectivity returns:
//!
//! - [`store`]: durable key-value cache and mutation outbox (SQLite)
//! - [`reachability`]: device / backend / origin reachability tracking
//! - [`sync`]: the coordinator that drains the outbox and hydrates the cache
//! - [`access`]: read-through / write-with-fallback data accessors
//! - [`api`]: a PostgREST-style [`Remote`](remote::Remote) implementation

pub mod access;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod outbox;
pub mod period;
pub mod reachability;
pub mod remote;
pub mod store;
pub mod sync;
pub mod views;

#[cfg(test)]
pub(crate) mod testing;

pub use access::{AccessError, DataAccess};
pub use api::{RemoteError, RestBackend};
pub use auth::{CredentialStore, Session, SessionData, SessionProvider};
pub use config::{Config, SyncConfig};
pub use error::FailureReason;
pub use events::{EventBus, SyncEvent};
pub use models::{DailyKey, DailyRecord, ProcedureCall, Profile};
pub use outbox::{OpKind, OutboxId, OutboxItem, OutboxOp};
pub use period::{Window, YearMonth};
pub use reachability::{HttpProber, Prober, ReachabilityMonitor, ReachabilityStatus};
pub use remote::Remote;
pub use store::{Cache, CacheEntry, Lease, Outbox, SqliteStore, Store, StoreError};
pub use sync::{
    FlushReport, HydrateReport, PassOutcome, PlatformSignal, SkipReason, SyncCoordinator,
    SyncReport, SyncTrigger,
};
