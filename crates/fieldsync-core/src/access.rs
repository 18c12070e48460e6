//! Offline-aware data accessors.
//!
//! Reads are served from the cache first and only go to the backend on a miss
//! while online. Writes go to the backend when it can take them and fall back
//! to the outbox otherwise; either way the caller gets the record back and the
//! cache reflects it immediately.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::FailureReason;
use crate::events::{EventBus, SyncEvent};
use crate::models::{DailyKey, DailyRecord, ProcedureCall, Profile, Record};
use crate::outbox::OutboxOp;
use crate::period::YearMonth;
use crate::reachability::ReachabilityMonitor;
use crate::remote::{Remote, Upsertable};
use crate::store::{keys, CacheEntry, Store, StoreError};
use crate::views::{merge_month, tombstone_daily, PendingKeys, WriteThrough};

#[derive(Error, Debug)]
pub enum AccessError {
    /// The write reached neither the backend nor the outbox.
    #[error("Write lost: could not be sent or queued ({reason})")]
    Lost {
        reason: FailureReason,
        #[source]
        source: StoreError,
    },
}

impl From<StoreError> for AccessError {
    fn from(e: StoreError) -> Self {
        AccessError::Lost {
            reason: e.reason(),
            source: e,
        }
    }
}

/// What the cache knows about a key.
enum Lookup<T> {
    /// Never fetched (or unreadable): ask the backend.
    Miss,
    /// Cached, possibly as a tombstone.
    Hit(Option<T>),
}

pub struct DataAccess<S, R> {
    store: Arc<S>,
    remote: Arc<R>,
    reachability: Arc<ReachabilityMonitor>,
    events: EventBus,
}

impl<S: Store, R: Remote> DataAccess<S, R> {
    pub fn new(
        store: Arc<S>,
        remote: Arc<R>,
        reachability: Arc<ReachabilityMonitor>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            remote,
            reachability,
            events,
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub async fn read_daily(&self, user: &str, date: NaiveDate) -> Option<DailyRecord> {
        let key = keys::daily(user, date);
        if let Lookup::Hit(record) = self.lookup(&key) {
            return record;
        }
        if !self.reachability.device_online() {
            return None;
        }

        match self.remote.fetch_daily(user, date).await {
            Ok(record) => {
                let cached = match &record {
                    Some(record) => record.write_through(self.store.as_ref()),
                    None => self.store.set(&key, &Value::Null),
                };
                self.log_cache_failure(&key, cached);
                record
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Remote read failed");
                None
            }
        }
    }

    /// Every record of `user` in `month`, ordered by date.
    pub async fn read_month(&self, user: &str, month: YearMonth) -> Vec<DailyRecord> {
        let key = keys::daily_month(user, month);
        if let Lookup::Hit(list) = self.lookup::<Vec<DailyRecord>>(&key) {
            return list.unwrap_or_default();
        }
        if !self.reachability.device_online() {
            return Vec::new();
        }

        let mut records = match self
            .remote
            .fetch_daily_range(user, month.first_day(), month.last_day())
            .await
        {
            Ok(records) => records,
            Err(e) => {
                debug!(key = %key, error = %e, "Remote read failed");
                return Vec::new();
            }
        };
        records.sort_by_key(|r| r.date);

        // Dates with a queued op keep their optimistic value
        let merged = PendingKeys::read(self.store.as_ref()).and_then(|pending| {
            merge_month(self.store.as_ref(), user, month, records.clone(), &pending)
        });
        match merged {
            Ok(list) => list,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not cache the month");
                records
            }
        }
    }

    pub async fn read_profile(&self, user: &str) -> Option<Profile> {
        let key = keys::profile(user);
        if let Lookup::Hit(profile) = self.lookup(&key) {
            return profile;
        }
        if !self.reachability.device_online() {
            return None;
        }

        match self.remote.fetch_profile(user).await {
            Ok(profile) => {
                let cached = match &profile {
                    Some(profile) => profile.write_through(self.store.as_ref()),
                    None => self.store.set(&key, &Value::Null),
                };
                self.log_cache_failure(&key, cached);
                profile
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Remote read failed");
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub async fn write_daily(&self, record: DailyRecord) -> Result<DailyRecord, AccessError> {
        self.write(record).await
    }

    pub async fn write_profile(&self, profile: Profile) -> Result<Profile, AccessError> {
        self.write(profile).await
    }

    pub async fn delete_daily(&self, user: &str, date: NaiveDate) -> Result<(), AccessError> {
        let key = DailyKey::new(user, date);
        if self.can_send(|op| match op {
            OutboxOp::UpsertDaily(r) => r.user == key.user && r.date == key.date,
            OutboxOp::DeleteDaily(k) => *k == key,
            _ => false,
        }) {
            match self.remote.delete_daily(user, &[date]).await {
                Ok(()) => {
                    let cached = tombstone_daily(self.store.as_ref(), &key);
                    self.log_cache_failure(&key.cache_key(), cached);
                    return Ok(());
                }
                Err(e) => debug!(
                    key = %key.cache_key(),
                    error = %e,
                    "Remote delete failed, queueing"
                ),
            }
        }

        self.defer(OutboxOp::DeleteDaily(key.clone()))?;
        let cached = tombstone_daily(self.store.as_ref(), &key);
        self.log_cache_failure(&key.cache_key(), cached);
        Ok(())
    }

    /// Invoke a remote procedure. Returns its result, or `None` when the call
    /// was queued for later replay.
    pub async fn call(&self, call: ProcedureCall) -> Result<Option<Value>, AccessError> {
        // Calls replay strictly in order, so one queued call holds back the rest
        if self.can_send(|op| matches!(op, OutboxOp::Call(_))) {
            match self.remote.call_procedure(&call).await {
                Ok(value) => return Ok(Some(value)),
                Err(e) => debug!(
                    procedure = %call.procedure,
                    error = %e,
                    "Remote call failed, queueing"
                ),
            }
        }
        self.defer(OutboxOp::Call(call))?;
        Ok(None)
    }

    async fn write<T: Upsertable>(&self, record: T) -> Result<T, AccessError> {
        if self.can_send(|op| record.same_record(op)) {
            let sent = T::upsert(self.remote.as_ref(), std::slice::from_ref(&record)).await;
            match sent {
                Ok(stored) => {
                    let confirmed = stored.into_iter().next().unwrap_or(record);
                    let cached = confirmed.write_through(self.store.as_ref());
                    self.log_cache_failure(&confirmed.cache_key(), cached);
                    return Ok(confirmed);
                }
                Err(e) => debug!(
                    key = %record.cache_key(),
                    error = %e,
                    "Remote write failed, queueing"
                ),
            }
        }

        self.defer(record.clone().into_op())?;
        let cached = record.write_through(self.store.as_ref());
        self.log_cache_failure(&record.cache_key(), cached);
        Ok(record)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// A write may go straight to the backend only when the device is online
    /// and nothing queued for the same target would replay after it.
    fn can_send(&self, queued_for_target: impl Fn(&OutboxOp) -> bool) -> bool {
        if !self.reachability.device_online() {
            return false;
        }
        match self.store.read_all() {
            Ok(items) => !items.iter().any(|item| queued_for_target(&item.op)),
            Err(e) => {
                warn!(error = %e, "Could not read the outbox, writing directly");
                true
            }
        }
    }

    fn defer(&self, op: OutboxOp) -> Result<(), AccessError> {
        let kind = op.kind();
        match self.store.enqueue(&op) {
            Ok(id) => {
                debug!(%id, kind = %kind, "Write deferred to the outbox");
                self.events.emit(SyncEvent::WriteDeferred { kind });
                Ok(())
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Could not queue write, it is lost");
                Err(e.into())
            }
        }
    }

    fn lookup<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        let entry: CacheEntry = match self.store.entry(key) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, treating as a miss");
                return Lookup::Miss;
            }
        };
        if entry.is_tombstone() {
            return Lookup::Hit(None);
        }
        match serde_json::from_value(entry.value) {
            Ok(value) => Lookup::Hit(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "Cached value does not decode, treating as a miss");
                Lookup::Miss
            }
        }
    }

    fn log_cache_failure(&self, key: &str, result: Result<(), StoreError>) {
        if let Err(e) = result {
            warn!(key, error = %e, "Could not update the cache");
        }
    }
}
