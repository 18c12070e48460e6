//! The outbox-flush pass.
//!
//! Pending items are collapsed into a replay plan first: later writes to the
//! same record supersede earlier ones, so only the latest state is sent and
//! every superseded id is settled with it. The plan then replays profile
//! upserts, daily upserts, procedure calls and finally deletes.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::NaiveDate;
use tracing::{debug, warn};

use super::FlushReport;
use crate::api::RemoteError;
use crate::config::SyncConfig;
use crate::error::FailureReason;
use crate::events::{EventBus, SyncEvent};
use crate::models::{DailyKey, DailyRecord, ProcedureCall, Profile, Record};
use crate::outbox::{OpKind, OutboxId, OutboxItem, OutboxOp};
use crate::remote::{Remote, Upsertable};
use crate::store::{Store, StoreError};
use crate::views::{tombstone_daily, PendingKeys, WriteThrough};

/// One replay unit and every outbox id it settles, oldest first.
#[derive(Debug)]
struct Pending<T> {
    value: T,
    ids: Vec<OutboxId>,
    /// Kind of the op that won compaction.
    kind: OpKind,
}

impl<T> Pending<T> {
    fn single(value: T, id: OutboxId, kind: OpKind) -> Self {
        Self {
            value,
            ids: vec![id],
            kind,
        }
    }
}

#[derive(Debug)]
enum DailyOp {
    Upsert(DailyRecord),
    Delete(DailyKey),
}

#[derive(Debug, Default)]
struct Plan {
    profiles: Vec<Pending<Profile>>,
    daily: Vec<Pending<DailyRecord>>,
    calls: Vec<Pending<ProcedureCall>>,
    deletes: Vec<Pending<DailyKey>>,
}

impl Plan {
    /// `items` must be in insertion order.
    fn build(items: Vec<OutboxItem>) -> Self {
        let mut profiles = Vec::new();
        let mut profile_index = HashMap::new();
        let mut daily = Vec::new();
        let mut daily_index = HashMap::new();
        let mut calls = Vec::new();

        for item in items {
            let id = item.id;
            match item.op {
                OutboxOp::UpsertProfile(profile) => {
                    let key = profile.id.clone();
                    let entry = Pending::single(profile, id, OpKind::UpsertProfile);
                    supersede(&mut profiles, &mut profile_index, key, entry);
                }
                OutboxOp::UpsertDaily(record) => {
                    let key = record.key();
                    let entry = Pending::single(DailyOp::Upsert(record), id, OpKind::UpsertDaily);
                    supersede(&mut daily, &mut daily_index, key, entry);
                }
                OutboxOp::DeleteDaily(key) => {
                    let op = DailyOp::Delete(key.clone());
                    let entry = Pending::single(op, id, OpKind::DeleteDaily);
                    supersede(&mut daily, &mut daily_index, key, entry);
                }
                OutboxOp::Call(call) => calls.push(Pending::single(call, id, OpKind::Call)),
            }
        }

        let mut plan = Plan {
            profiles,
            calls,
            ..Default::default()
        };
        for entry in daily {
            match entry.value {
                DailyOp::Upsert(record) => plan.daily.push(Pending {
                    value: record,
                    ids: entry.ids,
                    kind: entry.kind,
                }),
                DailyOp::Delete(key) => plan.deletes.push(Pending {
                    value: key,
                    ids: entry.ids,
                    kind: entry.kind,
                }),
            }
        }
        plan
    }
}

/// Fold `next` into the entry for `key`, keeping the entry's original
/// position so creation order is preserved.
fn supersede<K: Hash + Eq, T>(
    entries: &mut Vec<Pending<T>>,
    index: &mut HashMap<K, usize>,
    key: K,
    next: Pending<T>,
) {
    match index.get(&key) {
        Some(&i) => {
            let entry = &mut entries[i];
            entry.ids.extend(next.ids);
            entry.value = next.value;
            entry.kind = next.kind;
        }
        None => {
            index.insert(key, entries.len());
            entries.push(next);
        }
    }
}

/// Why the rest of a pass was abandoned.
enum Abort {
    Unauthenticated,
    Store(StoreError),
}

impl From<StoreError> for Abort {
    fn from(e: StoreError) -> Self {
        Abort::Store(e)
    }
}

impl Abort {
    fn reason(&self) -> FailureReason {
        match self {
            Abort::Unauthenticated => FailureReason::Unauthenticated,
            Abort::Store(e) => e.reason(),
        }
    }
}

/// Run one flush over everything currently pending.
pub(super) async fn run<S: Store, R: Remote>(
    store: &S,
    remote: &R,
    events: &EventBus,
    config: &SyncConfig,
) -> FlushReport {
    let items = match store.read_all() {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "Could not read the outbox");
            return FlushReport {
                aborted: Some(e.reason()),
                ..Default::default()
            };
        }
    };
    if items.is_empty() {
        return FlushReport::default();
    }

    let pending = items.len();
    let plan = Plan::build(items);
    debug!(
        pending,
        profiles = plan.profiles.len(),
        daily = plan.daily.len(),
        calls = plan.calls.len(),
        deletes = plan.deletes.len(),
        "Replay plan built"
    );

    let mut flush = Flush {
        store,
        remote,
        events,
        config,
        report: FlushReport::default(),
    };
    if let Err(abort) = flush.replay(plan).await {
        match &abort {
            Abort::Unauthenticated => warn!("Backend refused our credentials, abandoning flush"),
            Abort::Store(e) => warn!(error = %e, "Local storage failed, ending flush"),
        }
        flush.report.aborted = Some(abort.reason());
    }
    flush.report
}

struct Flush<'a, S, R> {
    store: &'a S,
    remote: &'a R,
    events: &'a EventBus,
    config: &'a SyncConfig,
    report: FlushReport,
}

impl<'a, S: Store, R: Remote> Flush<'a, S, R> {
    async fn replay(&mut self, plan: Plan) -> Result<(), Abort> {
        self.upserts(plan.profiles).await?;
        self.upserts(plan.daily).await?;
        self.calls(plan.calls).await?;
        self.deletes(plan.deletes).await
    }

    async fn upserts<T: Upsertable>(&mut self, entries: Vec<Pending<T>>) -> Result<(), Abort> {
        let batch_size = self.config.batch_size.max(1);
        for chunk in entries.chunks(batch_size) {
            let Some(err) = self.send_upsert(chunk).await? else {
                continue;
            };
            if err.reason().is_permanent() && chunk.len() > 1 {
                // Find the offending rows instead of parking the whole chunk
                warn!(
                    entity = T::entity_type(),
                    rows = chunk.len(),
                    error = %err,
                    "Batch rejected, retrying row by row"
                );
                for entry in chunk {
                    let single = std::slice::from_ref(entry);
                    if let Some(err) = self.send_upsert(single).await? {
                        self.settle_failure(single, &err)?;
                    }
                }
            } else {
                self.settle_failure(chunk, &err)?;
            }
        }
        Ok(())
    }

    /// One upsert call. Store failures abort; remote failures are handed back.
    async fn send_upsert<T: Upsertable>(
        &mut self,
        chunk: &[Pending<T>],
    ) -> Result<Option<RemoteError>, Abort> {
        let rows: Vec<T> = chunk.iter().map(|p| p.value.clone()).collect();
        self.report.remote_calls += 1;

        let stored = match T::upsert(self.remote, &rows).await {
            Ok(stored) => stored,
            Err(e) => return Ok(Some(e)),
        };
        self.confirm(chunk)?;
        // Anything still queued for these records was written after the chunk
        // was read, and its optimistic value wins
        let pending = PendingKeys::read(self.store)?;
        // A backend that does not echo rows back confirms what we sent
        let confirmed = if stored.is_empty() { &rows } else { &stored };
        for record in confirmed {
            let key = record.cache_key();
            if pending.contains(&key) {
                debug!(key = %key, "Newer write queued, keeping its cached value");
                continue;
            }
            if let Err(e) = record.write_through(self.store) {
                warn!(key = %key, error = %e, "Could not cache confirmed record");
            }
        }
        debug!(entity = T::entity_type(), rows = rows.len(), "Upsert chunk replayed");
        Ok(None)
    }

    /// Procedure calls are not idempotent, so a transient failure holds back
    /// every later call until the next pass.
    async fn calls(&mut self, calls: Vec<Pending<ProcedureCall>>) -> Result<(), Abort> {
        for (position, entry) in calls.iter().enumerate() {
            let single = std::slice::from_ref(entry);
            self.report.remote_calls += 1;
            match self.remote.call_procedure(&entry.value).await {
                Ok(_) => {
                    self.confirm(single)?;
                    debug!(procedure = %entry.value.procedure, "Procedure call replayed");
                }
                Err(e) => {
                    let permanent = e.reason().is_permanent();
                    self.settle_failure(single, &e)?;
                    if !permanent {
                        let held = calls.len() - position - 1;
                        if held > 0 {
                            debug!(held, "Holding later procedure calls back");
                        }
                        self.report.retained += held;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One delete call per user.
    async fn deletes(&mut self, deletes: Vec<Pending<DailyKey>>) -> Result<(), Abort> {
        let mut groups: Vec<(String, Vec<Pending<DailyKey>>)> = Vec::new();
        for entry in deletes {
            match groups.iter_mut().find(|(user, _)| *user == entry.value.user) {
                Some((_, group)) => group.push(entry),
                None => groups.push((entry.value.user.clone(), vec![entry])),
            }
        }

        for (user, group) in groups {
            let Some(err) = self.send_delete(&user, &group).await? else {
                continue;
            };
            if err.reason().is_permanent() && group.len() > 1 {
                warn!(
                    user = %user,
                    rows = group.len(),
                    error = %err,
                    "Delete rejected, retrying row by row"
                );
                for entry in &group {
                    let single = std::slice::from_ref(entry);
                    if let Some(err) = self.send_delete(&user, single).await? {
                        self.settle_failure(single, &err)?;
                    }
                }
            } else {
                self.settle_failure(&group, &err)?;
            }
        }
        Ok(())
    }

    async fn send_delete(
        &mut self,
        user: &str,
        entries: &[Pending<DailyKey>],
    ) -> Result<Option<RemoteError>, Abort> {
        let dates: Vec<NaiveDate> = entries.iter().map(|p| p.value.date).collect();
        self.report.remote_calls += 1;

        if let Err(e) = self.remote.delete_daily(user, &dates).await {
            return Ok(Some(e));
        }
        self.confirm(entries)?;
        let pending = PendingKeys::read(self.store)?;
        for entry in entries {
            let key = entry.value.cache_key();
            if pending.contains(&key) {
                debug!(key = %key, "Newer write queued, keeping its cached value");
                continue;
            }
            if let Err(e) = tombstone_daily(self.store, &entry.value) {
                warn!(key = %key, error = %e, "Could not tombstone deleted record");
            }
        }
        debug!(user, rows = dates.len(), "Delete replayed");
        Ok(None)
    }

    fn confirm<T>(&mut self, entries: &[Pending<T>]) -> Result<(), Abort> {
        for entry in entries {
            for &id in &entry.ids {
                self.store.remove(id)?;
            }
            self.report.replayed += entry.ids.len();
        }
        Ok(())
    }

    /// Decide what happens to entries whose replay failed.
    fn settle_failure<T>(
        &mut self,
        entries: &[Pending<T>],
        err: &RemoteError,
    ) -> Result<(), Abort> {
        let reason = err.reason();
        if reason == FailureReason::Unauthenticated {
            return Err(Abort::Unauthenticated);
        }

        let message = err.to_string();
        for entry in entries {
            if reason.is_permanent() {
                self.dead_letter(entry, &message)?;
                continue;
            }

            let mut attempts = 0;
            for &id in &entry.ids {
                attempts = attempts.max(self.store.record_failure(id, &message)?);
            }
            match self.config.max_attempts {
                Some(max) if attempts >= max => self.dead_letter(entry, &message)?,
                _ => self.report.retained += entry.ids.len(),
            }
        }
        warn!(
            items = entries.len(),
            reason = %reason,
            error = %err,
            "Replay failed"
        );
        Ok(())
    }

    fn dead_letter<T>(&mut self, entry: &Pending<T>, message: &str) -> Result<(), Abort> {
        for &id in &entry.ids {
            self.store.mark_failed(id, message)?;
            self.events.emit(SyncEvent::DeadLettered {
                id,
                kind: entry.kind,
                reason: message.to_string(),
            });
        }
        self.report.dead_lettered += entry.ids.len();
        warn!(
            kind = %entry.kind,
            ids = entry.ids.len(),
            error = message,
            "Outbox item dead-lettered"
        );
        Ok(())
    }
}
