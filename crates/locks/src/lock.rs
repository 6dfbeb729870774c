//! Lock manager contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Lock acquisition/release error.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another holder owns the lock for the requested key.
    #[error("lock busy: {0}")]
    Busy(String),

    /// The backing store(s) could not be reached.
    #[error("lock transport error: {0}")]
    Io(String),

    /// The manager was constructed with an unusable configuration.
    #[error("invalid lock configuration: {0}")]
    Config(String),
}

/// A held lease on a distributed lock.
///
/// Dropping a lease does NOT release the lock; the lease simply expires on
/// the store side. Release explicitly via [`LockManager::release`] when the
/// critical section ends before the lease does.
#[derive(Debug, Clone)]
pub struct LockLease {
    key: String,
    token: String,
    lease: Duration,
}

impl LockLease {
    pub(crate) fn new(key: String, token: String, lease: Duration) -> Self {
        Self { key, token, lease }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    /// The wall-clock window this lease was granted for.
    pub fn lease(&self) -> Duration {
        self.lease
    }
}

/// Lease-based mutual exclusion across replicas.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take the lock, retrying up to `max_tries` times.
    ///
    /// The acquisition must complete within a wall-clock window smaller
    /// than `lease`, otherwise the attempt counts as failed even if a
    /// majority of stores granted it.
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        max_tries: u32,
    ) -> Result<LockLease, LockError>;

    /// Release a held lease. Only the holder's token can release the key;
    /// a lease that already expired releases as a no-op.
    async fn release(&self, lease: &LockLease) -> Result<(), LockError>;
}

#[async_trait]
impl<L> LockManager for Arc<L>
where
    L: LockManager + ?Sized,
{
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        max_tries: u32,
    ) -> Result<LockLease, LockError> {
        (**self).acquire(key, lease, max_tries).await
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        (**self).release(lease).await
    }
}
