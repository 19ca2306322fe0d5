//! Fan-out event broadcaster.
//!
//! Each subscriber owns an unbounded channel; publishing never waits on a
//! subscriber, and a dropped or failing subscriber only affects itself.
//!
//! ```text
//! Engine ── publish ──► EventBus
//!                         ├── mpsc ──► dashboard subscription
//!                         ├── mpsc ──► metrics subscription
//!                         └── mpsc ──► forwarder ──► EventSink (external)
//! ```
//!
//! Events for one order are sent to every subscriber while the registry lock
//! is held, so each subscriber observes them in publish order. Subscribers
//! only see events published after they subscribed.
//!
//! # Example
//!
//! ```
//! use orderflow::core::EventBus;
//! use orderflow::domain::EventType;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::new();
//! let mut dashboard = bus.subscribe();
//!
//! bus.publish(EventType::OrderReceived, Some("order-1"), json!({ "stage": "received" }));
//! bus.publish(EventType::OrderValidated, Some("order-1"), json!({ "stage": "validated" }));
//!
//! let first = dashboard.recv().await.unwrap();
//! let second = dashboard.recv().await.unwrap();
//! assert_eq!((first.sequence, second.sequence), (1, 2));
//! # });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapters::EventSink;
use crate::domain::{Event, EventType};

struct SubscriberSlot {
    id: u64,
    tx: mpsc::UnboundedSender<Arc<Event>>,
}

#[derive(Default)]
struct BusInner {
    next_subscriber_id: u64,
    subscribers: Vec<SubscriberSlot>,
    /// Last sequence number handed out per order
    sequences: HashMap<String, u64>,
    published: u64,
}

/// Cheaply cloneable handle to a shared broadcaster
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

/// Receiving end of one subscriber
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<Event>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_subscriber_id += 1;
        let id = inner.next_subscriber_id;
        inner.subscribers.push(SubscriberSlot { id, tx });
        debug!(subscriber = id, "Subscriber registered");
        Subscription { id, rx }
    }

    /// Publish an event to every live subscriber
    pub fn publish(
        &self,
        event_type: EventType,
        order_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Arc<Event> {
        let mut inner = self.inner.lock();
        inner.published += 1;

        let sequence = match order_id {
            Some(id) => {
                let seq = inner.sequences.entry(id.to_string()).or_insert(0);
                *seq += 1;
                *seq
            }
            None => 0,
        };

        let event = Arc::new(
            Event::new(event_type, order_id.map(str::to_string), payload).with_sequence(sequence),
        );

        inner.subscribers.retain(|slot| {
            if slot.tx.send(Arc::clone(&event)).is_err() {
                debug!(subscriber = slot.id, "Subscriber dropped, removing");
                false
            } else {
                true
            }
        });

        event
    }

    /// Forget the sequence counter of an order that left the engine
    pub fn forget_order(&self, order_id: &str) {
        self.inner.lock().sequences.remove(order_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn published_count(&self) -> u64 {
        self.inner.lock().published
    }

    /// Forward every future event to an external sink on its own task.
    ///
    /// Sink errors are logged and skipped; the task ends when the bus is dropped.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Err(e) = sink.publish(&event).await {
                    warn!(
                        sink = sink.name(),
                        event_type = %event.event_type,
                        error = %e,
                        "Event sink rejected event"
                    );
                }
            }
            debug!(sink = sink.name(), "Event sink forwarder stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(EventType::OrderReceived, Some("o-1"), json!({}));

        assert_eq!(a.recv().await.unwrap().event_type, EventType::OrderReceived);
        assert_eq!(b.recv().await.unwrap().event_type, EventType::OrderReceived);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        bus.publish(EventType::OrderReceived, Some("o-1"), json!({}));

        let mut late = bus.subscribe();
        assert!(late.try_recv().is_none());

        bus.publish(EventType::OrderValidated, Some("o-1"), json!({}));
        let event = late.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::OrderValidated);
        assert_eq!(event.sequence, 2);
    }

    #[tokio::test]
    async fn test_per_order_sequences() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        bus.publish(EventType::OrderReceived, Some("a"), json!({}));
        bus.publish(EventType::OrderReceived, Some("b"), json!({}));
        bus.publish(EventType::OrderValidated, Some("a"), json!({}));
        bus.publish(EventType::AutomationStatus, None, json!({}));

        let seqs: Vec<(Option<String>, u64)> = (0..4)
            .map(|_| {
                let e = sub.try_recv().unwrap();
                (e.order_id.clone(), e.sequence)
            })
            .collect();

        assert_eq!(
            seqs,
            vec![
                (Some("a".to_string()), 1),
                (Some("b".to_string()), 1),
                (Some("a".to_string()), 2),
                (None, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_removed() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        let gone = bus.subscribe();
        drop(gone);

        bus.publish(EventType::OrderReceived, Some("o-1"), json!({}));
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
    }

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn publish(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_affect_others() {
        let bus = EventBus::new();
        let _forwarder = bus.attach_sink(Arc::new(FailingSink));
        let mut healthy = bus.subscribe();

        bus.publish(EventType::OrderReceived, Some("o-1"), json!({}));
        bus.publish(EventType::OrderValidated, Some("o-1"), json!({}));

        assert_eq!(healthy.recv().await.unwrap().sequence, 1);
        assert_eq!(healthy.recv().await.unwrap().sequence, 2);
    }
}
