//! Records carried through the cache and the outbox.
//!
//! The core only knows the identifying columns of each record; every other
//! column is kept verbatim in an `extra` map so the data-access layer owns the
//! business meaning.
//!
//! - `DailyRecord`, `DailyKey`: per-day field-service entries
//! - `Profile`: the per-user profile row (carries the user's time zone)
//! - `ProcedureCall`: a side-effecting remote procedure invocation

pub mod daily;
pub mod procedure;
pub mod profile;

use serde::{de::DeserializeOwned, Serialize};

pub use daily::{DailyKey, DailyRecord};
pub use procedure::ProcedureCall;
pub use profile::Profile;

/// A record that lives under a single cache key.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Cache key for this record (e.g. `daily:u1:2025-01-05`).
    fn cache_key(&self) -> String;

    /// Entity type name used in logs.
    fn entity_type() -> &'static str;
}
