//! Sync coordinator: drains the outbox and refreshes the cache.
//!
//! Two independent passes, each guarded by its own async lock:
//! - the **flush** pass replays queued mutations against the backend
//!   ([`flush`]), also holding a store lease so two processes sharing one
//!   database never flush at once
//! - the **hydration** pass pulls the current window of records into the
//!   cache ([`hydrate`])
//!
//! A trigger that arrives while a pass is running gets
//! [`PassOutcome::Coalesced`] back. Passes only run when the backend is
//! reachable; nothing is scheduled on a timer.

mod flush;
mod hydrate;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::SessionProvider;
use crate::config::SyncConfig;
use crate::error::FailureReason;
use crate::events::{EventBus, SyncEvent};
use crate::period::{resolve_time_zone, Window};
use crate::reachability::ReachabilityMonitor;
use crate::remote::Remote;
use crate::store::Store;

/// Lease name shared by every process flushing the same store.
const FLUSH_LEASE: &str = "outbox-flush";

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The device is offline or the backend did not answer its probe.
    Unreachable,
    /// Nobody is signed in, so there is no user to hydrate for.
    NoSession,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome<T> {
    Completed(T),
    /// Another run of the same pass was already in flight.
    Coalesced,
    Skipped(SkipReason),
}

impl<T> PassOutcome<T> {
    pub fn completed(&self) -> Option<&T> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Outbox items confirmed by the backend and removed.
    pub replayed: usize,
    pub remote_calls: usize,
    /// Items left pending for the next pass.
    pub retained: usize,
    pub dead_lettered: usize,
    /// Set when the pass stopped early.
    pub aborted: Option<FailureReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HydrateReport {
    pub user: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Records written from the backend snapshot.
    pub records: usize,
    /// Dates left alone because an outbox op is still pending for them.
    pub kept_pending: usize,
    pub failed: Option<FailureReason>,
}

impl HydrateReport {
    fn new(user: &str, window: Window) -> Self {
        Self {
            user: user.to_string(),
            start: window.start(),
            end: window.end(),
            records: 0,
            kept_pending: 0,
            failed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub flush: PassOutcome<FlushReport>,
    pub hydrate: PassOutcome<HydrateReport>,
}

// ============================================================================
// Triggers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// The device went from offline to online.
    Reconnect,
    /// The application became visible while online.
    BecameVisible,
    InitialLoad,
    Requested,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::BecameVisible => "visible",
            SyncTrigger::InitialLoad => "initial-load",
            SyncTrigger::Requested => "requested",
        })
    }
}

/// Signals the platform feeds into [`SyncCoordinator::spawn_signal_loop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSignal {
    Online,
    Offline,
    Visible,
    Hidden,
    SyncRequested,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct SyncCoordinator<S, R> {
    store: Arc<S>,
    remote: Arc<R>,
    reachability: Arc<ReachabilityMonitor>,
    session: Arc<dyn SessionProvider>,
    events: EventBus,
    config: SyncConfig,
    default_time_zone: Option<String>,
    flush_guard: Mutex<()>,
    hydrate_guard: Mutex<()>,
    /// Identifies this process in the flush lease.
    holder: String,
}

impl<S, R> SyncCoordinator<S, R>
where
    S: Store + 'static,
    R: Remote + 'static,
{
    pub fn new(
        store: Arc<S>,
        remote: Arc<R>,
        reachability: Arc<ReachabilityMonitor>,
        session: Arc<dyn SessionProvider>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            remote,
            reachability,
            session,
            events,
            config: SyncConfig::default(),
            default_time_zone: None,
            flush_guard: Mutex::new(()),
            hydrate_guard: Mutex::new(()),
            holder: format!("{}-{:08x}", std::process::id(), rand::random::<u32>()),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Zone used for the hydration window when the session has none.
    pub fn with_default_time_zone(mut self, zone: Option<String>) -> Self {
        self.default_time_zone = zone;
        self
    }

    pub fn reachability(&self) -> &Arc<ReachabilityMonitor> {
        &self.reachability
    }

    /// Replay everything pending in the outbox.
    pub async fn flush_outbox(&self) -> PassOutcome<FlushReport> {
        if !self.reachability.can_sync() {
            debug!("Backend unreachable, skipping flush");
            return PassOutcome::Skipped(SkipReason::Unreachable);
        }
        let Ok(_guard) = self.flush_guard.try_lock() else {
            debug!("Flush already running, coalescing");
            return PassOutcome::Coalesced;
        };

        match self
            .store
            .try_acquire(FLUSH_LEASE, &self.holder, self.config.lease_ttl())
        {
            Ok(true) => {}
            Ok(false) => {
                info!("Another process is flushing this store, coalescing");
                return PassOutcome::Coalesced;
            }
            Err(e) => {
                warn!(error = %e, "Could not take the flush lease");
                return PassOutcome::Completed(FlushReport {
                    aborted: Some(e.reason()),
                    ..Default::default()
                });
            }
        }

        let report = flush::run(
            self.store.as_ref(),
            self.remote.as_ref(),
            &self.events,
            &self.config,
        )
        .await;

        if let Err(e) = self.store.release(FLUSH_LEASE, &self.holder) {
            warn!(error = %e, "Could not release the flush lease");
        }

        if report.replayed > 0 {
            self.events.emit(SyncEvent::SyncFlushed {
                replayed: report.replayed,
            });
        }
        info!(
            replayed = report.replayed,
            retained = report.retained,
            dead_lettered = report.dead_lettered,
            calls = report.remote_calls,
            "Flush pass finished"
        );
        PassOutcome::Completed(report)
    }

    /// Refresh the cache for the current window.
    pub async fn hydrate(&self) -> PassOutcome<HydrateReport> {
        self.hydrate_at(Utc::now()).await
    }

    /// Hydrate the window containing `now` in the user's time zone.
    pub async fn hydrate_at(&self, now: DateTime<Utc>) -> PassOutcome<HydrateReport> {
        if !self.reachability.can_sync() {
            debug!("Backend unreachable, skipping hydration");
            return PassOutcome::Skipped(SkipReason::Unreachable);
        }
        let Some(session) = self.session.current() else {
            debug!("No session, skipping hydration");
            return PassOutcome::Skipped(SkipReason::NoSession);
        };
        let Ok(_guard) = self.hydrate_guard.try_lock() else {
            debug!("Hydration already running, coalescing");
            return PassOutcome::Coalesced;
        };

        let tz = resolve_time_zone(
            session.time_zone.as_deref(),
            self.default_time_zone.as_deref(),
        );
        let window = Window::current(now, tz, self.config.lookback_months);
        debug!(
            user = %session.user_id,
            tz = %tz,
            start = %window.start(),
            end = %window.end(),
            "Hydrating"
        );

        let report = hydrate::run(
            self.store.as_ref(),
            self.remote.as_ref(),
            &session.user_id,
            window,
        )
        .await;

        if report.failed.is_none() {
            self.events.emit(SyncEvent::DataUpdated);
        }
        info!(
            records = report.records,
            kept_pending = report.kept_pending,
            "Hydration pass finished"
        );
        PassOutcome::Completed(report)
    }

    /// Run both passes concurrently.
    pub async fn run(&self, trigger: SyncTrigger) -> SyncReport {
        info!(trigger = %trigger, "Sync triggered");
        let (flush, hydrate) = tokio::join!(self.flush_outbox(), self.hydrate());
        SyncReport { flush, hydrate }
    }

    /// Start-up: record the platform's connectivity and sync if online.
    pub async fn initial_load(&self, online: bool) -> Option<SyncReport> {
        self.reachability.set_device_online(online).await;
        if online {
            Some(self.run(SyncTrigger::InitialLoad).await)
        } else {
            None
        }
    }

    /// React to one platform signal. Returns the report when it triggered a sync.
    pub async fn handle_signal(&self, signal: PlatformSignal) -> Option<SyncReport> {
        match signal {
            PlatformSignal::Online => {
                let was_online = self.reachability.device_online();
                self.reachability.set_device_online(true).await;
                if was_online {
                    None
                } else {
                    Some(self.run(SyncTrigger::Reconnect).await)
                }
            }
            PlatformSignal::Offline => {
                self.reachability.set_device_online(false).await;
                None
            }
            PlatformSignal::Visible => {
                if !self.reachability.device_online() {
                    return None;
                }
                self.reachability.refresh().await;
                Some(self.run(SyncTrigger::BecameVisible).await)
            }
            PlatformSignal::Hidden => None,
            PlatformSignal::SyncRequested => {
                self.reachability.refresh().await;
                Some(self.run(SyncTrigger::Requested).await)
            }
        }
    }

    /// Consume platform signals until the sender side is dropped.
    pub fn spawn_signal_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<PlatformSignal>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                debug!(?signal, "Platform signal");
                self.handle_signal(signal).await;
            }
            debug!("Platform signal channel closed");
        })
    }
}
