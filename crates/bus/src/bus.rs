//! Event bus contract (mechanics only).
//!
//! One dispatch loop per `(bus instance, topic)`. Per-topic ordering on a
//! single subscription mirrors the underlying transport; no cross-publisher
//! ordering is promised.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bus-level error.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Transport failure (broker unreachable, connection dropped).
    #[error("bus transport error: {0}")]
    Io(String),
}

/// Callback invoked by a subscription's dispatch loop for each message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &str);
}

/// Fleet-wide pub/sub bus.
///
/// A subscription whose underlying channel closes unexpectedly terminates
/// silently; callers that need persistence must re-subscribe.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Fire-and-forget delivery to all currently-connected subscribers.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError>;

    /// Register an in-process handler and start its dispatch loop.
    ///
    /// At most one subscription per topic is active on a given bus
    /// instance; subscribing again to the same topic stops the previous
    /// dispatch loop before installing the new one.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), BusError>;

    /// Idempotent; signals the dispatch loop to exit and releases the
    /// subscription. Never blocks.
    async fn unsubscribe(&self, topic: &str);
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        (**self).publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        (**self).subscribe(topic, handler).await
    }

    async fn unsubscribe(&self, topic: &str) {
        (**self).unsubscribe(topic).await
    }
}

/// [`EventHandler`] built from an async closure.
pub struct FnHandler {
    inner: Box<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>,
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler
where
    F: Fn(String, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    FnHandler {
        inner: Box::new(move |topic, payload| Box::pin(f(topic, payload))),
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, topic: &str, payload: &str) {
        (self.inner)(topic.to_owned(), payload.to_owned()).await
    }
}

/// A running dispatch loop and its stop signal.
///
/// The stop channel is buffered so a stop can always be signalled without
/// blocking, even when the loop has already exited on its own.
pub(crate) struct SubscriptionHandle {
    pub(crate) stop: mpsc::Sender<()>,
    #[allow(dead_code)] // Loops exit via the stop signal; the handle is kept for ownership.
    pub(crate) task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Signal the dispatch loop to exit. Never blocks.
    pub(crate) fn signal_stop(&self) {
        let _ = self.stop.try_send(());
    }
}
