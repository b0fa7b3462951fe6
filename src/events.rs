use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{Error, Result};

/// Per-subscriber buffer bound. A subscriber that falls further behind than
/// this loses the oldest buffered events and its drop counter advances.
pub const SUBSCRIBER_BUFFER: usize = 1024;

/// Topic-keyed publish/subscribe fan-out for a single server. Publishing
/// never blocks: each subscriber owns an independent buffer and a stalled
/// consumer only ever loses its own oldest events.
pub struct EventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    destroyed: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Publishes a payload to every current subscriber of the topic. A no-op
    /// once the bus has been destroyed or when nobody is subscribed.
    pub fn publish(&self, topic: &str, payload: impl Into<String>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }

        let topics = self.topics.lock().expect("event bus lock poisoned");
        if let Some(tx) = topics.get(topic) {
            // Send only fails when there are no receivers left, which is fine.
            let _ = tx.send(payload.into());
        } else {
            trace!(topic, "dropping event published to topic with no subscribers");
        }
    }

    pub fn subscribe(&self, topic: &str) -> Result<Subscription> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::BusDestroyed);
        }

        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0);

        Ok(Subscription {
            topic: topic.to_string(),
            rx: Some(tx.subscribe()),
            dropped: 0,
        })
    }

    /// Marks the bus destroyed and drops all topic senders. Existing
    /// subscribers drain their buffered events and then observe the end of
    /// the stream; new subscriptions fail.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.topics.lock().expect("event bus lock poisoned").clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receive handle for one topic. Delivery is FIFO in publish order; events
/// lost to the drop-oldest policy are counted in `dropped`.
pub struct Subscription {
    topic: String,
    rx: Option<broadcast::Receiver<String>>,
    dropped: u64,
}

impl Subscription {
    /// Receives the next event, or `None` once the bus is destroyed (after
    /// draining) or the subscription was cancelled.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    trace!(topic = %self.topic, lost = n, "subscriber lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Number of events this subscriber has lost to the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Cancels the subscription. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("console").unwrap();

        for i in 0..10 {
            bus.publish("console", format!("line {i}"));
        }

        for i in 0..10 {
            assert_eq!(sub.recv().await.unwrap(), format!("line {i}"));
        }
        assert_eq!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn fans_out_to_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("state").unwrap();
        let mut b = bus.subscribe("state").unwrap();

        bus.publish("state", "running");

        assert_eq!(a.recv().await.unwrap(), "running");
        assert_eq!(b.recv().await.unwrap(), "running");
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new();
        let mut console = bus.subscribe("console").unwrap();

        bus.publish("state", "starting");
        bus.publish("console", "hello");

        assert_eq!(console.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("console").unwrap();

        let total = SUBSCRIBER_BUFFER + 100;
        for i in 0..total {
            bus.publish("console", format!("{i}"));
        }

        // The first event received is the oldest one still buffered.
        let first = sub.recv().await.unwrap();
        assert_eq!(first, "100");
        assert_eq!(sub.dropped(), 100);
    }

    #[tokio::test]
    async fn destroy_stops_publish_and_subscribe() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("console").unwrap();

        bus.publish("console", "before");
        bus.destroy();
        bus.publish("console", "after");

        // Buffered events drain, then the stream ends.
        assert_eq!(sub.recv().await.unwrap(), "before");
        assert!(sub.recv().await.is_none());
        assert!(bus.subscribe("console").is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("console").unwrap();

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscriber_only_sees_events_after_subscribing() {
        let bus = EventBus::new();
        {
            let mut early = bus.subscribe("console").unwrap();
            bus.publish("console", "one");
            assert_eq!(early.recv().await.unwrap(), "one");
        }

        let mut late = bus.subscribe("console").unwrap();
        bus.publish("console", "two");
        assert_eq!(late.recv().await.unwrap(), "two");
    }
}
