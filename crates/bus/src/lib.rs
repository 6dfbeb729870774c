//! `fleetlink-bus` — topic-based publish/subscribe across a fleet.
//!
//! Replicas talk to each other through a shared broker (Redis pub/sub in
//! production). Delivery is best-effort: subscribers that are not connected
//! at publish time do not receive the message, and consumers must be
//! idempotent.

pub mod bus;
pub mod memory;
pub mod redis;

pub use bus::{handler_fn, BusError, EventBus, EventHandler, FnHandler};
pub use memory::{InMemoryBroker, InMemoryEventBus};
pub use redis::RedisEventBus;
