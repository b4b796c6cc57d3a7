//! Pub/sub backbone. Generalizes a single `tokio::sync::broadcast::channel`
//! fan-out idiom into named topics with ordered, individually-unsubscribable
//! handlers — a subscribe/unsubscribe-by-handle contract a bare broadcast
//! channel doesn't give us.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

/// An event published on the bus. `source` is used for loop-prevention:
/// handlers that themselves publish must tag their own re-publications so
/// the originating component can recognize and skip its own echo.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub source: String,
    pub payload: Value,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Opaque handle returned by `subscribe`, required by `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

struct Inner {
    // topic -> ordered subscriber list; insertion order is dispatch order.
    subscribers: HashMap<String, Vec<Subscriber>>,
}

/// Event bus: subscribe by topic, publish fans out concurrently to every
/// subscriber on that topic. A handler's error is logged, never propagated —
/// one broken subscriber must not stop delivery to the rest.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: HashMap::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut inner = self.inner.lock();
        inner
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, handler });
        debug!(topic, id = id.0, "subscribed");
        id
    }

    /// Safe to call twice or for an id that was never registered: both are
    /// no-ops, matching the original's idempotent unsubscribe.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.subscribers.get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
        debug!(topic, id = id.0, "unsubscribed");
    }

    /// Dispatches to every current subscriber of `event.topic` concurrently.
    /// The subscriber snapshot is taken under the lock and then released
    /// before dispatch, so a handler that subscribes/unsubscribes during its
    /// own invocation (re-entrancy) never deadlocks and never observes a
    /// torn subscriber list.
    pub async fn publish(&self, event: Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .get(&event.topic)
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };

        if handlers.is_empty() {
            return;
        }

        let mut tasks = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let event = event.clone();
            tasks.push(tokio::spawn(async move {
                handler.handle(&event).await;
            }));
        }
        for task in tasks {
            if let Err(err) = task.await {
                warn!(topic = %event.topic, error = %err, "event handler task panicked");
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("signal.detected", Arc::new(CountingHandler(count.clone())));
        bus.subscribe("signal.detected", Arc::new(CountingHandler(count.clone())));

        bus.publish(Event {
            topic: "signal.detected".into(),
            source: "test".into(),
            payload: Value::Null,
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe("order.filled", Arc::new(CountingHandler(count.clone())));
        bus.unsubscribe("order.filled", id);

        bus.publish(Event {
            topic: "order.filled".into(),
            source: "test".into(),
            payload: Value::Null,
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count("order.filled"), 0);
    }

    #[tokio::test]
    async fn double_unsubscribe_is_a_no_op() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe("x", Arc::new(CountingHandler(count)));
        bus.unsubscribe("x", id);
        bus.unsubscribe("x", id);
        assert_eq!(bus.subscriber_count("x"), 0);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event {
            topic: "nobody.listens".into(),
            source: "test".into(),
            payload: Value::Null,
        })
        .await;
    }
}
