//! The remote operations the core replays and reads through.
//!
//! The core is agnostic to the protocol; [`RestBackend`](crate::api::RestBackend)
//! is the PostgREST implementation.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::api::RemoteError;
use crate::models::{DailyRecord, ProcedureCall, Profile};
use crate::outbox::OutboxOp;
use crate::views::WriteThrough;

#[async_trait]
pub trait Remote: Send + Sync {
    /// Upsert a batch of daily records in one call, returning the stored rows.
    async fn upsert_daily(&self, records: &[DailyRecord]) -> Result<Vec<DailyRecord>, RemoteError>;

    async fn upsert_profiles(&self, profiles: &[Profile]) -> Result<Vec<Profile>, RemoteError>;

    /// Delete one user's daily records for the given dates in one call.
    async fn delete_daily(&self, user: &str, dates: &[NaiveDate]) -> Result<(), RemoteError>;

    async fn call_procedure(&self, call: &ProcedureCall) -> Result<Value, RemoteError>;

    async fn fetch_daily(
        &self,
        user: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyRecord>, RemoteError>;

    /// Every daily record of `user` with `start <= date <= end`.
    async fn fetch_daily_range(
        &self,
        user: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRecord>, RemoteError>;

    async fn fetch_profile(&self, user: &str) -> Result<Option<Profile>, RemoteError>;
}

/// Records written through a bulk upsert, either directly or via the outbox.
pub(crate) trait Upsertable: WriteThrough {
    fn upsert<'a, R: Remote>(
        remote: &'a R,
        rows: &'a [Self],
    ) -> BoxFuture<'a, Result<Vec<Self>, RemoteError>>;

    /// The outbox op that replays this write.
    fn into_op(self) -> OutboxOp;

    /// Whether `op` writes the same record.
    fn same_record(&self, op: &OutboxOp) -> bool;
}

impl Upsertable for DailyRecord {
    fn upsert<'a, R: Remote>(
        remote: &'a R,
        rows: &'a [Self],
    ) -> BoxFuture<'a, Result<Vec<Self>, RemoteError>> {
        remote.upsert_daily(rows)
    }

    fn into_op(self) -> OutboxOp {
        OutboxOp::UpsertDaily(self)
    }

    fn same_record(&self, op: &OutboxOp) -> bool {
        match op {
            OutboxOp::UpsertDaily(other) => other.user == self.user && other.date == self.date,
            OutboxOp::DeleteDaily(key) => key.user == self.user && key.date == self.date,
            _ => false,
        }
    }
}

impl Upsertable for Profile {
    fn upsert<'a, R: Remote>(
        remote: &'a R,
        rows: &'a [Self],
    ) -> BoxFuture<'a, Result<Vec<Self>, RemoteError>> {
        remote.upsert_profiles(rows)
    }

    fn into_op(self) -> OutboxOp {
        OutboxOp::UpsertProfile(self)
    }

    fn same_record(&self, op: &OutboxOp) -> bool {
        matches!(op, OutboxOp::UpsertProfile(other) if other.id == self.id)
    }
}
