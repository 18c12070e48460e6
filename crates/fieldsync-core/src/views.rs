//! Keeping single-record keys and their denormalized month lists consistent.
//!
//! Both the accessors (optimistic and confirmed writes) and the coordinator
//! (replayed writes) go through these helpers so the two cache shapes never
//! disagree.

use std::collections::HashSet;

use serde_json::Value;
use tracing::warn;

use crate::models::{DailyKey, DailyRecord, Profile, Record};
use crate::period::YearMonth;
use crate::store::{get_as, keys, set_as, Cache, Outbox, StoreError};

/// A record that knows every cache key it has to update when written.
pub trait WriteThrough: Record {
    fn write_through<C: Cache>(&self, cache: &C) -> Result<(), StoreError>;
}

impl WriteThrough for DailyRecord {
    fn write_through<C: Cache>(&self, cache: &C) -> Result<(), StoreError> {
        put_daily(cache, self)
    }
}

impl WriteThrough for Profile {
    fn write_through<C: Cache>(&self, cache: &C) -> Result<(), StoreError> {
        set_as(cache, &self.cache_key(), self)
    }
}

/// Store a daily record and splice it into its month list when that list is
/// cached.
pub fn put_daily<C: Cache>(cache: &C, record: &DailyRecord) -> Result<(), StoreError> {
    set_as(cache, &record.cache_key(), record)?;
    update_month(cache, &record.user, record.month(), |list| {
        match list.iter_mut().find(|r| r.date == record.date) {
            Some(slot) => *slot = record.clone(),
            None => {
                list.push(record.clone());
                list.sort_by_key(|r| r.date);
            }
        }
    })
}

/// Tombstone a daily record and drop it from its month list.
pub fn tombstone_daily<C: Cache>(cache: &C, key: &DailyKey) -> Result<(), StoreError> {
    cache.set(&key.cache_key(), &Value::Null)?;
    update_month(cache, &key.user, key.month(), |list| {
        list.retain(|r| r.date != key.date)
    })
}

/// Cache keys whose record still has an op waiting in the outbox. The cached
/// value of such a key is the optimistic one and must not be replaced by a
/// server copy.
#[derive(Debug, Default)]
pub(crate) struct PendingKeys(HashSet<String>);

impl PendingKeys {
    pub(crate) fn read<O: Outbox>(outbox: &O) -> Result<Self, StoreError> {
        let mut pending = Self::default();
        pending.extend(outbox)?;
        Ok(pending)
    }

    /// Add keys of ops queued since the last read.
    pub(crate) fn extend<O: Outbox>(&mut self, outbox: &O) -> Result<(), StoreError> {
        for item in outbox.read_all()? {
            if let Some(key) = item.op.cache_key() {
                self.0.insert(key);
            }
        }
        Ok(())
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }
}

/// Build the month list for `user` from server `rows`, keeping the cached
/// optimistic value of every pending date. Rows for pending dates are
/// dropped and non-pending rows are written to their single keys.
pub(crate) fn merge_month<C: Cache>(
    cache: &C,
    user: &str,
    month: YearMonth,
    rows: Vec<DailyRecord>,
    pending: &PendingKeys,
) -> Result<Vec<DailyRecord>, StoreError> {
    let mut list = Vec::new();
    for record in rows {
        if record.user != user || record.month() != month {
            continue;
        }
        if !pending.contains(&record.cache_key()) {
            set_as(cache, &record.cache_key(), &record)?;
            list.push(record);
        }
    }
    for date in month.days() {
        let key = keys::daily(user, date);
        if pending.contains(&key) {
            // A pending delete left a tombstone, which reads as None
            if let Some(record) = get_as::<DailyRecord>(cache, &key)? {
                list.push(record);
            }
        }
    }
    list.sort_by_key(|r| r.date);
    set_as(cache, &keys::daily_month(user, month), &list)?;
    Ok(list)
}

/// Read-modify-write of a month list. A list that was never fetched is left
/// absent: one record is not the whole month.
fn update_month<C, F>(cache: &C, user: &str, month: YearMonth, edit: F) -> Result<(), StoreError>
where
    C: Cache,
    F: FnOnce(&mut Vec<DailyRecord>),
{
    let key = keys::daily_month(user, month);
    let value = cache.get(&key)?;
    if value.is_null() {
        return Ok(());
    }

    let mut list: Vec<DailyRecord> = match serde_json::from_value(value) {
        Ok(list) => list,
        Err(e) => {
            warn!(key = %key, error = %e, "Cached month list does not decode, leaving it");
            return Ok(());
        }
    };
    edit(&mut list);
    set_as(cache, &key, &list)
}
