//! Lifecycle events published to the application layers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::outbox::{OpKind, OutboxId};
use crate::reachability::ReachabilityStatus;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// A hydration pass refreshed the cache; re-render from it.
    DataUpdated,
    /// At least one outbox item was replayed during a flush pass.
    SyncFlushed { replayed: usize },
    ReachabilityChanged(ReachabilityStatus),
    /// A write was queued instead of confirmed (hook for a toast/banner).
    WriteDeferred { kind: OpKind },
    /// An outbox item will not be retried any more.
    DeadLettered {
        id: OutboxId,
        kind: OpKind,
        reason: String,
    },
}

/// Fan-out of [`SyncEvent`]s. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            trace!("No subscribers for sync event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        EventBus::new().emit(SyncEvent::DataUpdated);
    }

    #[tokio::test]
    async fn test_clones_share_channel() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.clone().emit(SyncEvent::SyncFlushed { replayed: 2 });
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SyncFlushed { replayed: 2 });
    }

    #[test]
    fn test_event_names() {
        let value = serde_json::to_value(SyncEvent::DataUpdated).unwrap();
        assert_eq!(value["event"], "data-updated");
        let value = serde_json::to_value(SyncEvent::SyncFlushed { replayed: 1 }).unwrap();
        assert_eq!(value["event"], "sync-flushed");
    }
}
