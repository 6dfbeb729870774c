//! In-memory lock manager for tests/dev.
//!
//! Share one instance (via `Arc`) between several engines to simulate a
//! fleet coordinating on a single store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::lock::{LockError, LockLease, LockManager};

#[derive(Debug)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// Single-process lease lock with the same expiry semantics as the Redis
/// implementation.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    held: Mutex<HashMap<String, Held>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        _max_tries: u32,
    ) -> Result<LockLease, LockError> {
        let mut held = self.held.lock().unwrap();
        let now = Instant::now();

        if let Some(existing) = held.get(key) {
            if existing.expires_at > now {
                return Err(LockError::Busy(key.to_owned()));
            }
        }

        let token = Uuid::new_v4().to_string();
        held.insert(
            key.to_owned(),
            Held {
                token: token.clone(),
                expires_at: now + lease,
            },
        );
        Ok(LockLease::new(key.to_owned(), token, lease))
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let mut held = self.held.lock().unwrap();
        if let Some(existing) = held.get(lease.key()) {
            if existing.token == lease.token() {
                held.remove(lease.key());
            }
        }
        Ok(())
    }
}
