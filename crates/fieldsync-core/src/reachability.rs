//! Device, backend and origin reachability.
//!
//! The platform's online flag only says a network interface is up. A VPN
//! problem or backend outage leaves the backend unreachable while "online",
//! and a captive portal can hide even the serving origin. The monitor probes
//! both with short HEAD requests and publishes every change.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::events::{EventBus, SyncEvent};

/// Default probe timeout. Probes that take longer count as unreachable.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ReachabilityStatus {
    /// The device reports a network connection.
    pub reachable: bool,
    pub backend_reachable: bool,
    pub origin_reachable: bool,
}

impl ReachabilityStatus {
    /// The coordinator only runs when the backend itself answers.
    pub fn can_sync(&self) -> bool {
        self.reachable && self.backend_reachable
    }
}

/// Issues one reachability probe. Must never panic and must fail closed.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> bool;
}

/// Probes with a HEAD request. Any response, whatever its status, proves the
/// host answered.
#[derive(Clone)]
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str, timeout: Duration) -> bool {
        let request = self.client.head(url).timeout(timeout).send();
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => {
                debug!(url, status = %response.status(), "Probe answered");
                true
            }
            Ok(Err(e)) => {
                debug!(url, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(url, timeout_ms = timeout.as_millis() as u64, "Probe timed out");
                false
            }
        }
    }
}

pub struct ReachabilityMonitor {
    prober: Box<dyn Prober>,
    backend_url: String,
    origin_url: String,
    timeout: Duration,
    /// Serializes read-modify-publish so concurrent probes cannot interleave.
    status: Mutex<ReachabilityStatus>,
    tx: watch::Sender<ReachabilityStatus>,
    events: EventBus,
}

impl ReachabilityMonitor {
    pub fn new(
        prober: Box<dyn Prober>,
        backend_url: impl Into<String>,
        origin_url: impl Into<String>,
        events: EventBus,
    ) -> Self {
        let (tx, _) = watch::channel(ReachabilityStatus::default());
        Self {
            prober,
            backend_url: backend_url.into(),
            origin_url: origin_url.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
            status: Mutex::new(ReachabilityStatus::default()),
            tx,
            events,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Latest published status.
    pub fn status(&self) -> ReachabilityStatus {
        *self.tx.borrow()
    }

    pub fn device_online(&self) -> bool {
        self.status().reachable
    }

    pub fn can_sync(&self) -> bool {
        self.status().can_sync()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReachabilityStatus> {
        self.tx.subscribe()
    }

    pub async fn probe_backend(&self) -> bool {
        let ok = self.prober.probe(&self.backend_url, self.timeout).await;
        self.update(|s| s.backend_reachable = ok && s.reachable);
        ok
    }

    pub async fn probe_origin(&self) -> bool {
        let ok = self.prober.probe(&self.origin_url, self.timeout).await;
        self.update(|s| s.origin_reachable = ok && s.reachable);
        ok
    }

    /// Apply the platform's connectivity signal. Going offline clears the
    /// finer-grained facts without probing; coming online re-probes.
    pub async fn set_device_online(&self, online: bool) -> ReachabilityStatus {
        if online {
            self.update(|s| s.reachable = true);
            self.refresh().await
        } else {
            self.update(|s| {
                s.reachable = false;
                s.backend_reachable = false;
                s.origin_reachable = false;
            })
        }
    }

    /// Probe backend and origin concurrently and publish the result.
    pub async fn refresh(&self) -> ReachabilityStatus {
        if !self.device_online() {
            return self.status();
        }
        let (backend, origin) = tokio::join!(
            self.prober.probe(&self.backend_url, self.timeout),
            self.prober.probe(&self.origin_url, self.timeout),
        );
        self.update(|s| {
            // The device may have gone offline while we were probing
            s.backend_reachable = backend && s.reachable;
            s.origin_reachable = origin && s.reachable;
        })
    }

    fn update(&self, apply: impl FnOnce(&mut ReachabilityStatus)) -> ReachabilityStatus {
        let mut guard = match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = *guard;
        apply(&mut guard);
        let after = *guard;

        if after != before {
            info!(
                reachable = after.reachable,
                backend = after.backend_reachable,
                origin = after.origin_reachable,
                "Reachability changed"
            );
            self.tx.send_replace(after);
            self.events.emit(SyncEvent::ReachabilityChanged(after));
        }
        after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProber;

    fn monitor(prober: FakeProber, events: EventBus) -> ReachabilityMonitor {
        ReachabilityMonitor::new(
            Box::new(prober),
            "https://api.test/rest/v1/",
            "https://app.test/",
            events,
        )
    }

    #[tokio::test]
    async fn test_starts_offline() {
        let m = monitor(FakeProber::all_up(), EventBus::new());
        assert_eq!(m.status(), ReachabilityStatus::default());
        assert!(!m.can_sync());
    }

    #[tokio::test]
    async fn test_online_probes_and_publishes_once() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let m = monitor(FakeProber::all_up(), events);

        let status = m.set_device_online(true).await;
        assert!(status.can_sync());
        assert!(status.origin_reachable);

        // reachable flips first, then the probes land
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(SyncEvent::ReachabilityChanged(status)));

        // Nothing changed, nothing published
        m.refresh().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backend_down_while_online() {
        let prober = FakeProber::all_up();
        prober.set_up("https://api.test/rest/v1/", false);
        let m = monitor(prober, EventBus::new());

        let status = m.set_device_online(true).await;
        assert!(status.reachable);
        assert!(!status.backend_reachable);
        assert!(status.origin_reachable);
        assert!(!status.can_sync());
    }

    #[tokio::test]
    async fn test_probe_backend_touches_only_backend() {
        let events = EventBus::new();
        let prober = FakeProber::all_up();
        let m = monitor(prober.clone(), events.clone());
        m.set_device_online(true).await;
        let mut rx = events.subscribe();

        prober.set_up("https://api.test/rest/v1/", false);
        assert!(!m.probe_backend().await);

        let status = m.status();
        assert!(status.reachable);
        assert!(!status.backend_reachable);
        assert!(status.origin_reachable);
        assert_eq!(rx.try_recv().unwrap(), SyncEvent::ReachabilityChanged(status));
        assert!(rx.try_recv().is_err());

        // Origin still answers, so probing it changes nothing
        assert!(m.probe_origin().await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_probe_origin_touches_only_origin() {
        let events = EventBus::new();
        let prober = FakeProber::all_up();
        let m = monitor(prober.clone(), events.clone());
        m.set_device_online(true).await;
        let mut rx = events.subscribe();

        prober.set_up("https://app.test/", false);
        assert!(!m.probe_origin().await);

        let status = m.status();
        assert!(status.backend_reachable);
        assert!(!status.origin_reachable);
        assert!(status.can_sync());
        assert_eq!(rx.try_recv().unwrap(), SyncEvent::ReachabilityChanged(status));

        prober.set_up("https://app.test/", true);
        assert!(m.probe_origin().await);
        assert!(m.status().origin_reachable);
        assert_eq!(rx.try_recv().unwrap(), SyncEvent::ReachabilityChanged(m.status()));
    }

    #[tokio::test]
    async fn test_probe_while_offline_keeps_facts_clear() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let m = monitor(FakeProber::all_up(), events);

        assert!(m.probe_backend().await);
        assert!(m.probe_origin().await);
        assert_eq!(m.status(), ReachabilityStatus::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_clears_without_probing() {
        let prober = FakeProber::all_up();
        let calls = prober.calls();
        let m = monitor(prober, EventBus::new());

        m.set_device_online(true).await;
        let before = calls.load(std::sync::atomic::Ordering::SeqCst);
        let status = m.set_device_online(false).await;
        assert_eq!(status, ReachabilityStatus::default());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), before);

        // Refreshing while offline does not probe either
        m.refresh().await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_watch_subscribers_see_changes() {
        let m = monitor(FakeProber::all_up(), EventBus::new());
        let mut rx = m.subscribe();
        m.set_device_online(true).await;
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().can_sync());
    }

    #[tokio::test]
    async fn test_http_probe_fails_closed() {
        let prober = HttpProber::new();
        // Port 9 on localhost: refused or timed out, never "reachable"
        let ok = prober
            .probe("http://127.0.0.1:9/", Duration::from_millis(200))
            .await;
        assert!(!ok);
    }
}
