#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **ctxmesh-bus** – In-process context event bus for CtxMesh.
//!
//! This crate provides the publish/subscribe channel that connects the
//! context store to the replication server. It is deliberately small: an
//! in-memory broadcast ring with no persistence or I/O concerns.
//!
//! Delivery is fire-and-forget from the publisher's standpoint. Every
//! subscriber owns a cursor into a bounded ring buffer; a subscriber that
//! falls behind skips the oldest pending events and observes a lag error,
//! which consuming layers translate into a full reconcile (`resync` on the
//! wire). Publishers never block on slow subscribers.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;

use ctxmesh_types::ContextEvent;

/// Default ring buffer capacity per bus.
///
/// Bounds how far a subscriber may fall behind before it is forced into a
/// reconcile instead of replay.
pub const DEFAULT_CAPACITY: usize = 256;

//─────────────────────────────
//  Event bus trait
//─────────────────────────────

/// Publish/subscribe abstraction for committed context mutations.
///
/// Constructed once at startup and injected into the store and the
/// replication server; tests instantiate isolated buses.
pub trait EventBus: Send + Sync {
    /// Publish an event to all current subscribers.
    ///
    /// Completes immediately; slow subscribers lag rather than exert
    /// backpressure on the publisher.
    fn publish(&self, event: &ContextEvent) -> Result<()>;

    /// Subscribe to events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<ContextEvent>;

    /// Number of currently attached subscribers.
    fn subscriber_count(&self) -> usize;
}

//─────────────────────────────
//  In-memory bus implementation
//─────────────────────────────

/// Broadcast-ring implementation of [`EventBus`] using Tokio channels.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<ContextEvent>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InMemoryBus {
    /// Create a bus with the given ring buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, event: &ContextEvent) -> Result<()> {
        // A send error only means there are no subscribers right now.
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.tx.subscribe()
    }

    fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ctxmesh_types::{ContextId, ContextMetadata};
    use tokio::sync::broadcast::error::RecvError;

    fn updated(id: &str, version: u64) -> ContextEvent {
        ContextEvent::Updated {
            id: ContextId::new(id).unwrap(),
            metadata: ContextMetadata {
                version,
                last_modified: Utc::now(),
                size: 2,
                extra: serde_json::Map::new(),
            },
        }
    }

    #[tokio::test]
    async fn basic_publish_subscribe() {
        let bus = InMemoryBus::new(16);
        let mut rx = bus.subscribe();

        let event = updated("c1", 1);
        bus.publish(&event).unwrap();

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn fan_out_to_multiple_subscribers() {
        let bus = InMemoryBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let event = ContextEvent::Deleted {
            id: ContextId::new("gone").unwrap(),
        };
        bus.publish(&event).unwrap();

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = InMemoryBus::new(4);
        bus.publish(&updated("c1", 1)).unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = InMemoryBus::new(2);
        let mut rx = bus.subscribe();

        for v in 1..=5 {
            bus.publish(&updated("hot", v)).unwrap();
        }

        // The ring kept only the newest events; the receiver is told how
        // far behind it fell and then resumes from what is still buffered.
        match rx.recv().await {
            Err(RecvError::Lagged(skipped)) => assert!(skipped >= 1),
            Ok(_) => panic!("expected lag for an overflowed subscriber"),
            Err(e) => panic!("unexpected recv error: {e}"),
        }
        let next = rx.recv().await.unwrap();
        match next {
            ContextEvent::Updated { metadata, .. } => assert!(metadata.version >= 4),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribers_observe_publication_order() {
        let bus = InMemoryBus::new(64);
        let mut rx = bus.subscribe();

        for v in 1..=10 {
            bus.publish(&updated("ordered", v)).unwrap();
        }

        for expected in 1..=10 {
            match rx.recv().await.unwrap() {
                ContextEvent::Updated { metadata, .. } => {
                    assert_eq!(metadata.version, expected)
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
