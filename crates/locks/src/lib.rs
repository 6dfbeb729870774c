//! `fleetlink-locks` — distributed mutual exclusion over shared key/value
//! stores.
//!
//! A lease-based quorum lock (Redlock-style): the holder owns the key for
//! a bounded wall-clock window and nothing renews it. Callers that want
//! "exactly one replica does this" semantics size the lease to cover the
//! critical window and simply let it expire.

pub mod lock;
pub mod memory;
pub mod redis;

pub use lock::{LockError, LockLease, LockManager};
pub use memory::InMemoryLockManager;
pub use redis::RedisLockManager;
