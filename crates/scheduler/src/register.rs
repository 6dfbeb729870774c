//! Shared next-execution register.
//!
//! The register is the fleet's agreement point: whichever replica fires a
//! tick writes the next fire instant here, and every replica refreshes its
//! in-memory schedule from it. The TTL (roughly one interval) bounds how
//! stale an abandoned value can get.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::entry::scheduler_key;

/// Register access error.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("register transport error: {0}")]
    Io(String),
}

/// Fleet-wide `(job_name, cron_spec) → next fire instant` register.
#[async_trait]
pub trait ScheduleRegister: Send + Sync {
    /// Load the agreed next fire instant (unix seconds), if present.
    async fn load(&self, job_name: &str, cron_spec: &str) -> Result<Option<i64>, RegisterError>;

    /// Store the next fire instant with a bounded lifetime.
    async fn store(
        &self,
        job_name: &str,
        cron_spec: &str,
        fire_at: i64,
        ttl: Duration,
    ) -> Result<(), RegisterError>;
}

#[async_trait]
impl<R> ScheduleRegister for Arc<R>
where
    R: ScheduleRegister + ?Sized,
{
    async fn load(&self, job_name: &str, cron_spec: &str) -> Result<Option<i64>, RegisterError> {
        (**self).load(job_name, cron_spec).await
    }

    async fn store(
        &self,
        job_name: &str,
        cron_spec: &str,
        fire_at: i64,
        ttl: Duration,
    ) -> Result<(), RegisterError> {
        (**self).store(job_name, cron_spec, fire_at, ttl).await
    }
}

fn map_redis_error(err: redis::RedisError) -> RegisterError {
    RegisterError::Io(err.to_string())
}

/// Redis-backed register under `scheduler:{job}-{base64url(spec)}`.
pub struct RedisScheduleRegister {
    conn: ConnectionManager,
}

impl RedisScheduleRegister {
    pub async fn connect(client: redis::Client) -> Result<Self, RegisterError> {
        let conn = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ScheduleRegister for RedisScheduleRegister {
    async fn load(&self, job_name: &str, cron_spec: &str) -> Result<Option<i64>, RegisterError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(scheduler_key(job_name, cron_spec))
            .await
            .map_err(map_redis_error)?;

        // A zero or garbled value is as good as a miss.
        Ok(raw
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|ts| *ts != 0))
    }

    async fn store(
        &self,
        job_name: &str,
        cron_spec: &str,
        fire_at: i64,
        ttl: Duration,
    ) -> Result<(), RegisterError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                scheduler_key(job_name, cron_spec),
                fire_at,
                ttl.as_secs().max(1),
            )
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

/// In-memory register for tests/dev. Share one instance (via `Arc`) among
/// several schedulers to simulate a fleet.
#[derive(Debug, Default)]
pub struct InMemoryScheduleRegister {
    values: Mutex<HashMap<String, (i64, Instant)>>,
}

impl InMemoryScheduleRegister {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleRegister for InMemoryScheduleRegister {
    async fn load(&self, job_name: &str, cron_spec: &str) -> Result<Option<i64>, RegisterError> {
        let values = self.values.lock().unwrap();
        Ok(values
            .get(&scheduler_key(job_name, cron_spec))
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(ts, _)| *ts))
    }

    async fn store(
        &self,
        job_name: &str,
        cron_spec: &str,
        fire_at: i64,
        ttl: Duration,
    ) -> Result<(), RegisterError> {
        let mut values = self.values.lock().unwrap();
        values.insert(
            scheduler_key(job_name, cron_spec),
            (fire_at, Instant::now() + ttl),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_expire_with_their_ttl() {
        let register = InMemoryScheduleRegister::new();
        register
            .store("job", "* * * * *", 1234, Duration::from_millis(30))
            .await
            .unwrap();

        assert_eq!(register.load("job", "* * * * *").await.unwrap(), Some(1234));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(register.load("job", "* * * * *").await.unwrap(), None);
    }

    #[tokio::test]
    async fn specs_are_namespaced_per_job_and_spec() {
        let register = InMemoryScheduleRegister::new();
        register
            .store("a", "* * * * *", 1, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(register.load("b", "* * * * *").await.unwrap(), None);
        assert_eq!(register.load("a", "0 * * * *").await.unwrap(), None);
    }
}
