//! Redlock-style quorum lock over 1..N independent Redis instances.
//!
//! With a single instance this degrades to the plain
//! `SET key token NX PX lease` primitive. With several, an acquisition
//! must win a majority of instances within a wall-clock window smaller
//! than the lease, and partial acquisitions are rolled back with a
//! token-checked delete.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::lock::{LockError, LockLease, LockManager};

// Token-checked delete: only the holder may release the key.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

pub(crate) fn quorum(instances: usize) -> usize {
    instances / 2 + 1
}

/// Quorum lease lock across independent Redis instances.
pub struct RedisLockManager {
    pools: Vec<ConnectionManager>,
    quorum: usize,
    release_script: redis::Script,
}

impl std::fmt::Debug for RedisLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockManager")
            .field("pools", &self.pools.len())
            .field("quorum", &self.quorum)
            .finish()
    }
}

impl RedisLockManager {
    /// Connect all instances. Zero clients is fatal configuration.
    pub async fn connect(clients: Vec<redis::Client>) -> Result<Self, LockError> {
        if clients.is_empty() {
            return Err(LockError::Config(
                "at least one redis client is required".to_owned(),
            ));
        }

        let mut pools = Vec::with_capacity(clients.len());
        for client in clients {
            let pool = ConnectionManager::new(client)
                .await
                .map_err(|e| LockError::Io(e.to_string()))?;
            pools.push(pool);
        }

        let quorum = quorum(pools.len());
        Ok(Self {
            pools,
            quorum,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    async fn try_set_nx(
        conn: &mut ConnectionManager,
        key: &str,
        token: &str,
        lease_ms: u64,
    ) -> Result<bool, redis::RedisError> {
        let v: redis::Value = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(conn)
            .await?;
        Ok(!matches!(v, redis::Value::Nil))
    }

    /// Best-effort token-checked delete on every instance.
    async fn release_everywhere(&self, key: &str, token: &str) -> usize {
        let mut released = 0;
        for pool in &self.pools {
            let mut conn = pool.clone();
            let res: Result<i64, _> = self
                .release_script
                .key(key)
                .arg(token)
                .invoke_async(&mut conn)
                .await;
            match res {
                Ok(n) => released += n as usize,
                Err(e) => warn!(key, error = %e, "lock release failed on one instance"),
            }
        }
        released
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        max_tries: u32,
    ) -> Result<LockLease, LockError> {
        let token = Uuid::new_v4().to_string();
        let lease_ms = (lease.as_millis().max(1)) as u64;
        let tries = max_tries.max(1);
        let mut reachable = false;

        for attempt in 0..tries {
            let started = Instant::now();
            let mut acquired = 0usize;

            for pool in &self.pools {
                let mut conn = pool.clone();
                match Self::try_set_nx(&mut conn, key, &token, lease_ms).await {
                    Ok(true) => {
                        reachable = true;
                        acquired += 1;
                    }
                    Ok(false) => reachable = true,
                    Err(e) => debug!(key, error = %e, "lock probe failed on one instance"),
                }
            }

            // The quorum only counts if it was won before a meaningful
            // slice of the lease elapsed.
            if acquired >= self.quorum && started.elapsed() < lease {
                return Ok(LockLease::new(key.to_owned(), token, lease));
            }

            self.release_everywhere(key, &token).await;

            if attempt + 1 < tries {
                let backoff = rand::thread_rng().gen_range(50..250);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }

        if reachable {
            Err(LockError::Busy(key.to_owned()))
        } else {
            Err(LockError::Io(format!(
                "no redis instance reachable while locking {key}"
            )))
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        self.release_everywhere(lease.key(), lease.token()).await;
        Ok(())
    }
}
