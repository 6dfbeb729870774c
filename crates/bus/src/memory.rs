//! In-memory broker and bus for tests/dev.
//!
//! Several [`InMemoryEventBus`] instances attached to one
//! [`InMemoryBroker`] see each other's publishes, which simulates a fleet
//! of replicas sharing one pub/sub substrate without any IO.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{BusError, EventBus, EventHandler, SubscriptionHandle};

/// Process-local pub/sub substrate shared by every bus instance in a test.
#[derive(Default)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<(String, String)>>>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn publish(&self, topic: &str, payload: &str) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(subscribers) = topics.get_mut(topic) {
            // Drop any dead subscribers while publishing.
            subscribers.retain(|tx| tx.send((topic.to_owned(), payload.to_owned())).is_ok());
        }
    }

    fn attach(&self, topic: &str) -> mpsc::UnboundedReceiver<(String, String)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_owned())
            .or_default()
            .push(tx);
        rx
    }
}

/// One replica's view of the in-memory broker.
pub struct InMemoryEventBus {
    broker: Arc<InMemoryBroker>,
    subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
}

impl InMemoryEventBus {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        self.broker.publish(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        let mut rx = self.broker.attach(topic);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Some((topic, payload)) = msg else { return };
                        handler.handle(&topic, &payload).await;
                    }
                    _ = stop_rx.recv() => {
                        debug!("in-memory dispatch loop stopped intentionally");
                        return;
                    }
                }
            }
        });

        let replaced = {
            let mut subs = self.subscriptions.lock().unwrap();
            subs.insert(
                topic.to_owned(),
                SubscriptionHandle { stop: stop_tx, task },
            )
        };
        if let Some(old) = replaced {
            old.signal_stop();
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) {
        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(handle) = subs.get(topic) {
            handle.signal_stop();
        }
        subs.remove(topic);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::handler_fn;

    fn collecting_handler() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |topic, payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((topic, payload));
            }
        });
        (Arc::new(handler), rx)
    }

    async fn recv_one(
        rx: &mut mpsc::UnboundedReceiver<(String, String)>,
    ) -> Option<(String, String)> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_on_other_bus_instance() {
        let broker = InMemoryBroker::new();
        let bus_a = InMemoryEventBus::new(broker.clone());
        let bus_b = InMemoryEventBus::new(broker.clone());

        let (handler, mut rx) = collecting_handler();
        bus_b.subscribe("server-2", handler).await.unwrap();

        bus_a.publish("server-2", "hello").await.unwrap();

        let (topic, payload) = recv_one(&mut rx).await.expect("message delivered");
        assert_eq!(topic, "server-2");
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_a_noop() {
        let broker = InMemoryBroker::new();
        let bus = InMemoryEventBus::new(broker);
        bus.publish("nobody-home", "dropped").await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_is_idempotent() {
        let broker = InMemoryBroker::new();
        let bus = InMemoryEventBus::new(broker.clone());

        let (handler, mut rx) = collecting_handler();
        bus.subscribe("events", handler).await.unwrap();

        bus.publish("events", "one").await.unwrap();
        assert!(recv_one(&mut rx).await.is_some());

        bus.unsubscribe("events").await;
        bus.unsubscribe("events").await;

        // Give the dispatch loop time to observe its stop signal.
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("events", "two").await.unwrap();
        assert!(recv_one(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_previous_subscription() {
        let broker = InMemoryBroker::new();
        let bus = InMemoryEventBus::new(broker.clone());

        let (first, mut first_rx) = collecting_handler();
        let (second, mut second_rx) = collecting_handler();

        bus.subscribe("events", first).await.unwrap();
        bus.subscribe("events", second).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish("events", "after-replace").await.unwrap();

        assert!(recv_one(&mut second_rx).await.is_some());
        assert!(recv_one(&mut first_rx).await.is_none());
    }
}
