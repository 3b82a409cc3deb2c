//! In-process typed pub/sub.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::topology::{Event, EventType};

/// Handle returned by [`Broadcaster::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Debug)]
struct Listener {
    types: HashSet<EventType>,
    queue: mpsc::UnboundedSender<Event>,
}

/// Fans topology events out to registered listeners.
#[derive(Debug, Default)]
pub struct Broadcaster {
    listeners: DashMap<ListenerId, Listener>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `delivery` for every type in `event_types`.
    ///
    /// Spawns a forwarder task, so this must run inside a Tokio runtime. The
    /// same channel may be registered any number of times; each registration
    /// gets its own ID.
    pub fn add_listener(&self, delivery: mpsc::Sender<Event>, event_types: &[EventType]) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (queue, mut pending) = mpsc::unbounded_channel::<Event>();

        tokio::spawn(async move {
            while let Some(event) = pending.recv().await {
                if delivery.send(event).await.is_err() {
                    tracing::debug!(listener = %id, "Listener channel closed, dropping deliveries");
                    break;
                }
            }
        });

        self.listeners.insert(
            id,
            Listener {
                types: event_types.iter().copied().collect(),
                queue,
            },
        );
        tracing::debug!(listener = %id, types = ?event_types, "Listener registered");
        id
    }

    /// Remove every registration held under `id`.
    ///
    /// Already-queued events are still forwarded; the caller's channel is
    /// left open.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Queue `event` for every listener interested in its type.
    pub fn publish(&self, event: Event) {
        let event_type = event.event_type();
        let mut dead = Vec::new();
        let mut delivered = 0usize;

        for entry in self.listeners.iter() {
            if !entry.types.contains(&event_type) {
                continue;
            }
            if entry.queue.send(event.clone()).is_err() {
                dead.push(*entry.key());
            } else {
                delivered += 1;
            }
        }

        for id in dead {
            self.listeners.remove(&id);
        }

        tracing::trace!(
            event = ?event_type,
            upstream_id = %event.upstream_id(),
            listeners = delivered,
            "Event published"
        );
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Backend, Upstream};
    use std::time::Duration;

    fn upstream_added(id: &str) -> Event {
        Event::UpstreamAdded {
            upstream: Upstream::new(id),
        }
    }

    fn backend_added(up: &str, id: &str) -> Event {
        Event::BackendAdded {
            upstream_id: up.into(),
            backend: Backend::new(id, "http://127.0.0.1:1").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_publish_filters_by_type() {
        let broadcaster = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(8);
        broadcaster.add_listener(tx, &[EventType::BackendAdded]);

        broadcaster.publish(upstream_added("a"));
        broadcaster.publish(backend_added("a", "b1"));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type(), EventType::BackendAdded);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_delivery_preserves_publish_order() {
        let broadcaster = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(1);
        broadcaster.add_listener(tx, &EventType::ALL);

        for i in 0..20 {
            broadcaster.publish(upstream_added(&format!("u{}", i)));
        }
        for i in 0..20 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.upstream_id().as_str(), format!("u{}", i));
        }
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_block_others() {
        let broadcaster = Broadcaster::new();
        // Never drained, capacity one.
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(64);
        broadcaster.add_listener(slow_tx, &EventType::ALL);
        broadcaster.add_listener(fast_tx, &EventType::ALL);

        for i in 0..10 {
            broadcaster.publish(upstream_added(&format!("u{}", i)));
        }
        for _ in 0..10 {
            tokio::time::timeout(Duration::from_secs(1), fast_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_remove_listener_keeps_channel_open() {
        let broadcaster = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = broadcaster.add_listener(tx.clone(), &EventType::ALL);

        assert!(broadcaster.remove_listener(id));
        assert!(!broadcaster.remove_listener(id));
        broadcaster.publish(upstream_added("a"));

        tx.send(upstream_added("direct")).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.upstream_id().as_str(), "direct");
        assert_eq!(broadcaster.listener_count(), 0);
    }
}
