//! Redis pub/sub-backed event bus.
//!
//! Note: Redis pub/sub is not durable (messages are dropped if subscribers
//! are offline). That matches the bus contract: best-effort fan-out between
//! live replicas, nothing more.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{BusError, EventBus, EventHandler, SubscriptionHandle};

fn map_redis_error(err: redis::RedisError) -> BusError {
    BusError::Io(err.to_string())
}

/// Redis pub/sub bus.
///
/// Publishing goes through a shared auto-reconnecting connection; each
/// subscription holds its own dedicated pub/sub connection for the lifetime
/// of its dispatch loop.
pub struct RedisEventBus {
    client: redis::Client,
    publish_conn: ConnectionManager,
    subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
}

impl RedisEventBus {
    /// Connect the publish path and return the bus.
    pub async fn connect(client: redis::Client) -> Result<Self, BusError> {
        let publish_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            client,
            publish_conn,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.publish_conn.clone();
        let _: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_redis_error)?;
        pubsub.subscribe(topic).await.map_err(map_redis_error)?;

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let loop_topic = topic.to_owned();

        let task = tokio::spawn(async move {
            // Dropping the stream at loop exit tears down the pub/sub
            // connection and releases the server-side subscription.
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            debug!(topic = %loop_topic, "pub/sub channel closed, dispatch loop exiting");
                            return;
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        handler.handle(msg.get_channel_name(), &payload).await;
                    }
                    _ = stop_rx.recv() => {
                        debug!(topic = %loop_topic, "dispatch loop stopped intentionally");
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
        // Signal before removing the map entry; the buffered stop channel
        // means this cannot block even if the loop already exited.
        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(handle) = subs.get(topic) {
            handle.signal_stop();
        }
        subs.remove(topic);
    }
}

impl Drop for RedisEventBus {
    fn drop(&mut self) {
        let mut subs = self.subscriptions.lock().unwrap();
        for (_, handle) in subs.drain() {
            handle.signal_stop();
        }
    }
}
