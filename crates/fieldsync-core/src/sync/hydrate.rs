//! The cache-hydration pass.
//!
//! Pulls the authoritative daily records of the current window and rewrites
//! every key in it, so dates the backend no longer has become tombstones.
//! Dates with an unreplayed outbox op keep their optimistic value.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use super::HydrateReport;
use crate::models::{DailyRecord, Profile};
use crate::period::{Window, YearMonth};
use crate::remote::Remote;
use crate::store::{keys, set_as, Store, StoreError};
use crate::views::{merge_month, PendingKeys};

pub(super) async fn run<S: Store, R: Remote>(
    store: &S,
    remote: &R,
    user: &str,
    window: Window,
) -> HydrateReport {
    let mut report = HydrateReport::new(user, window);

    // Taken before the fetch so a flush racing us cannot make a stale
    // snapshot look authoritative
    let mut pending = match PendingKeys::read(store) {
        Ok(pending) => pending,
        Err(e) => {
            warn!(error = %e, "Could not read the outbox before hydrating");
            report.failed = Some(e.reason());
            return report;
        }
    };

    let rows = match remote
        .fetch_daily_range(user, window.start(), window.end())
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!(user, error = %e, "Hydration fetch failed");
            report.failed = Some(e.reason());
            return report;
        }
    };
    let profile = match remote.fetch_profile(user).await {
        Ok(profile) => profile,
        Err(e) => {
            warn!(user, error = %e, "Profile fetch failed, keeping cached profile");
            None
        }
    };

    // Writes enqueued while we were fetching are protected too
    let applied = match pending.extend(store) {
        Ok(()) => apply(store, user, window, rows, profile, &pending, &mut report),
        Err(e) => Err(e),
    };
    if let Err(e) = applied {
        warn!(error = %e, "Could not write hydrated records");
        report.failed = Some(e.reason());
    }
    report
}

fn apply<S: Store>(
    store: &S,
    user: &str,
    window: Window,
    rows: Vec<DailyRecord>,
    profile: Option<Profile>,
    pending: &PendingKeys,
    report: &mut HydrateReport,
) -> Result<(), StoreError> {
    let mut by_month: HashMap<YearMonth, Vec<DailyRecord>> = HashMap::new();
    for record in rows {
        if record.user == user && window.contains(record.date) {
            by_month.entry(record.month()).or_default().push(record);
        }
    }

    for month in window.months() {
        let rows = by_month.remove(&month).unwrap_or_default();
        for date in month.days() {
            let key = keys::daily(user, date);
            if pending.contains(&key) {
                report.kept_pending += 1;
            } else if !rows.iter().any(|r| r.date == date) {
                store.set(&key, &Value::Null)?;
            }
        }
        report.records += rows
            .iter()
            .filter(|r| !pending.contains(&keys::daily(user, r.date)))
            .count();
        let list = merge_month(store, user, month, rows, pending)?;
        debug!(user, month = %month, records = list.len(), "Month hydrated");
    }

    if let Some(profile) = profile {
        if pending.contains(&keys::profile(user)) {
            debug!(user, "Profile has a pending write, keeping it");
        } else {
            set_as(store, &keys::profile(user), &profile)?;
        }
    }
    Ok(())
}
