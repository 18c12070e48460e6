//! In-memory fakes for the remote, the prober and the session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use crate::api::RemoteError;
use crate::auth::{SessionData, SessionProvider};
use crate::models::{DailyRecord, ProcedureCall, Profile};
use crate::reachability::Prober;
use crate::remote::Remote;

// ============================================================================
// Prober
// ============================================================================

/// Answers probes from a table of URLs; unknown URLs use the default.
#[derive(Clone)]
pub struct FakeProber {
    default_up: bool,
    overrides: Arc<Mutex<HashMap<String, bool>>>,
    calls: Arc<AtomicUsize>,
}

impl FakeProber {
    pub fn all_up() -> Self {
        Self {
            default_up: true,
            overrides: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_up(&self, url: &str, up: bool) {
        self.overrides.lock().unwrap().insert(url.to_string(), up);
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, url: &str, _timeout: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.overrides
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(self.default_up)
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct FixedSession(pub Option<SessionData>);

impl FixedSession {
    pub fn user(user_id: &str, time_zone: Option<&str>) -> Self {
        let mut data = SessionData::new("jwt", user_id);
        data.time_zone = time_zone.map(str::to_string);
        Self(Some(data))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl SessionProvider for FixedSession {
    fn current(&self) -> Option<SessionData> {
        self.0.clone()
    }
}

// ============================================================================
// Remote
// ============================================================================

/// How a scripted remote call fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fail {
    Server,
    Timeout,
    Rejected,
    Unauthenticated,
}

impl Fail {
    fn error(self) -> RemoteError {
        match self {
            Fail::Server => RemoteError::ServerError("internal error".to_string()),
            Fail::Timeout => RemoteError::Timeout,
            Fail::Rejected => RemoteError::Rejected {
                status: 409,
                body: "conflict".to_string(),
            },
            Fail::Unauthenticated => RemoteError::Unauthenticated,
        }
    }
}

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    UpsertDaily(Vec<NaiveDate>),
    UpsertProfiles(Vec<String>),
    DeleteDaily(String, Vec<NaiveDate>),
    Call(String),
    FetchDaily(String, NaiveDate),
    FetchRange(String, NaiveDate, NaiveDate),
    FetchProfile(String),
}

#[derive(Default)]
struct RemoteState {
    calls: Vec<RemoteCall>,
    /// Failures keyed by call index (0-based, every call counts).
    fail_at: HashMap<usize, Fail>,
    fail_always: Option<Fail>,
    /// Upsert batches containing any of these dates are rejected.
    reject_dates: HashSet<NaiveDate>,
    daily: BTreeMap<(String, NaiveDate), DailyRecord>,
    profiles: HashMap<String, Profile>,
    next_id: usize,
    /// Runs inside every accepted daily upsert or delete.
    during_write: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl RemoteState {
    fn begin(&mut self, call: RemoteCall) -> Result<(), RemoteError> {
        let index = self.calls.len();
        self.calls.push(call);
        match self.fail_at.get(&index).copied().or(self.fail_always) {
            Some(fail) => Err(fail.error()),
            None => Ok(()),
        }
    }

    fn in_flight(&self) {
        if let Some(hook) = &self.during_write {
            hook();
        }
    }

    fn assign_id(&mut self) -> String {
        self.next_id += 1;
        format!("r{}", self.next_id)
    }
}

/// Scriptable in-memory backend. Upserts assign ids `r1`, `r2`, ...
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` while a daily upsert or delete is in flight, e.g. to queue
    /// a newer write behind the batch being replayed.
    pub fn during_write(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state.lock().unwrap().during_write = Some(Arc::new(hook));
    }

    pub fn fail_call(&self, index: usize, fail: Fail) {
        self.state.lock().unwrap().fail_at.insert(index, fail);
    }

    pub fn fail_always(&self, fail: Option<Fail>) {
        self.state.lock().unwrap().fail_always = fail;
    }

    pub fn reject_date(&self, date: NaiveDate) {
        self.state.lock().unwrap().reject_dates.insert(date);
    }

    pub fn seed_daily(&self, record: DailyRecord) {
        let mut state = self.state.lock().unwrap();
        state
            .daily
            .insert((record.user.clone(), record.date), record);
    }

    pub fn seed_profile(&self, profile: Profile) {
        self.state
            .lock()
            .unwrap()
            .profiles
            .insert(profile.id.clone(), profile);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn stored_daily(&self, user: &str, date: NaiveDate) -> Option<DailyRecord> {
        self.state
            .lock()
            .unwrap()
            .daily
            .get(&(user.to_string(), date))
            .cloned()
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn upsert_daily(&self, records: &[DailyRecord]) -> Result<Vec<DailyRecord>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.begin(RemoteCall::UpsertDaily(records.iter().map(|r| r.date).collect()))?;
        if records.iter().any(|r| state.reject_dates.contains(&r.date)) {
            return Err(Fail::Rejected.error());
        }
        state.in_flight();

        let mut stored = Vec::with_capacity(records.len());
        for record in records {
            let key = (record.user.clone(), record.date);
            let id = match state.daily.get(&key).and_then(|r| r.id.clone()) {
                Some(id) => id,
                None => state.assign_id(),
            };
            let mut row = record.clone();
            row.id = Some(id);
            state.daily.insert(key, row.clone());
            stored.push(row);
        }
        Ok(stored)
    }

    async fn upsert_profiles(&self, profiles: &[Profile]) -> Result<Vec<Profile>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.begin(RemoteCall::UpsertProfiles(profiles.iter().map(|p| p.id.clone()).collect()))?;
        for profile in profiles {
            state.profiles.insert(profile.id.clone(), profile.clone());
        }
        Ok(profiles.to_vec())
    }

    async fn delete_daily(&self, user: &str, dates: &[NaiveDate]) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.begin(RemoteCall::DeleteDaily(user.to_string(), dates.to_vec()))?;
        state.in_flight();
        for date in dates {
            state.daily.remove(&(user.to_string(), *date));
        }
        Ok(())
    }

    async fn call_procedure(&self, call: &ProcedureCall) -> Result<Value, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.begin(RemoteCall::Call(call.procedure.clone()))?;
        Ok(json!({ "procedure": call.procedure, "ok": true }))
    }

    async fn fetch_daily(
        &self,
        user: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyRecord>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.begin(RemoteCall::FetchDaily(user.to_string(), date))?;
        Ok(state.daily.get(&(user.to_string(), date)).cloned())
    }

    async fn fetch_daily_range(
        &self,
        user: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRecord>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.begin(RemoteCall::FetchRange(user.to_string(), start, end))?;
        Ok(state
            .daily
            .values()
            .filter(|r| r.user == user && r.date >= start && r.date <= end)
            .cloned()
            .collect())
    }

    async fn fetch_profile(&self, user: &str) -> Result<Option<Profile>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.begin(RemoteCall::FetchProfile(user.to_string()))?;
        Ok(state.profiles.get(user).cloned())
    }
}
