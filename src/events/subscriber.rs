//! Callback-style consumption of broadcaster events.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::broadcaster::{Broadcaster, ListenerId};
use crate::topology::{Event, EventType};

/// An async callback invoked for one event.
pub type Hook = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

const DEFAULT_CAPACITY: usize = 256;

/// Registers per-event-type hooks instead of reading a channel directly.
///
/// ```ignore
/// let sub = Subscriber::new()
///     .on(EventType::BackendAdded, move |event| async move { /* ... */ })
///     .subscribe(&broadcaster);
/// ```
pub struct Subscriber {
    hooks: HashMap<EventType, Vec<Hook>>,
    capacity: usize,
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber {
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Size of the private delivery channel.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn on<F, Fut>(mut self, event_type: EventType, hook: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Arc::new(move |event| -> BoxFuture<'static, ()> { Box::pin(hook(event)) });
        self.hooks.entry(event_type).or_default().push(hook);
        self
    }

    /// Register with the broadcaster and start the worker that drains the
    /// private channel.
    ///
    /// Hooks matching one event run concurrently, each in its own task; the
    /// next event is taken only once they have all finished, which keeps the
    /// per-listener publish order visible to hooks.
    pub fn subscribe(self, broadcaster: &Arc<Broadcaster>) -> Subscription {
        let (tx, mut rx) = mpsc::channel::<Event>(self.capacity);
        let types: Vec<EventType> = self.hooks.keys().copied().collect();
        let listener_id = broadcaster.add_listener(tx, &types);
        let hooks = self.hooks;

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(matching) = hooks.get(&event.event_type()) else {
                    continue;
                };
                let tasks = matching
                    .iter()
                    .map(|hook| tokio::spawn(hook(event.clone())));
                for result in join_all(tasks).await {
                    if let Err(e) = result {
                        tracing::error!(
                            event = ?event.event_type(),
                            error = %e,
                            "Event hook panicked"
                        );
                    }
                }
            }
            tracing::debug!(listener = %listener_id, "Subscriber worker exiting");
        });

        Subscription {
            listener_id,
            broadcaster: broadcaster.clone(),
            worker,
        }
    }
}

/// A live subscription; dropping it leaves the hooks registered.
#[derive(Debug)]
pub struct Subscription {
    listener_id: ListenerId,
    broadcaster: Arc<Broadcaster>,
    worker: JoinHandle<()>,
}

impl Subscription {
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    /// Deregister; events already queued are still delivered, then the worker
    /// exits on its own.
    pub async fn unsubscribe(self) {
        self.broadcaster.remove_listener(self.listener_id);
        let _ = self.worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Upstream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_hooks_receive_matching_events() {
        let broadcaster = Arc::new(Broadcaster::new());
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));

        let (a, r) = (added.clone(), removed.clone());
        let _sub = Subscriber::new()
            .on(EventType::UpstreamAdded, move |_| {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on(EventType::UpstreamRemoved, move |_| {
                let r = r.clone();
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                }
            })
            .subscribe(&broadcaster);

        broadcaster.publish(Event::UpstreamAdded {
            upstream: Upstream::new("a"),
        });
        broadcaster.publish(Event::UpstreamAdded {
            upstream: Upstream::new("b"),
        });
        broadcaster.publish(Event::UpstreamRemoved {
            upstream: Upstream::new("a"),
        });

        wait_until(|| added.load(Ordering::SeqCst) == 2 && removed.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_hooks_observe_publish_order() {
        let broadcaster = Arc::new(Broadcaster::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let _sub = Subscriber::new()
            .on(EventType::UpstreamAdded, move |event| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push(event.upstream_id().to_string());
                }
            })
            .subscribe(&broadcaster);

        for i in 0..5 {
            broadcaster.publish(Event::UpstreamAdded {
                upstream: Upstream::new(format!("u{}", i).as_str()),
            });
        }

        wait_until(|| seen.lock().unwrap().len() == 5).await;
        assert_eq!(*seen.lock().unwrap(), vec!["u0", "u1", "u2", "u3", "u4"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_worker() {
        let broadcaster = Arc::new(Broadcaster::new());
        let sub = Subscriber::new()
            .on(EventType::BackendAdded, |_| async {})
            .subscribe(&broadcaster);
        assert_eq!(broadcaster.listener_count(), 1);

        tokio::time::timeout(Duration::from_secs(1), sub.unsubscribe())
            .await
            .unwrap();
        assert_eq!(broadcaster.listener_count(), 0);
    }
}
