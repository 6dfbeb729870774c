//! Global directory: `client_id → owning server_id` in the shared store.
//!
//! Entries carry no TTL; the owning replica is responsible for cleanup on
//! detach and teardown. A replica that dies hard leaves stale entries, and
//! the receiving side tolerates them by dropping packets it cannot route.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

const FIELD_CLIENT_ID: &str = "cid";
const FIELD_SERVER_ID: &str = "sid";

/// Directory access error.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory transport error: {0}")]
    Io(String),
}

/// One client's registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client_id: String,
    pub server_id: String,
}

/// Fleet-wide client registry.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get(&self, client_id: &str) -> Result<Option<ConnectionInfo>, DirectoryError>;

    /// Atomic per-entry overwrite.
    async fn put(&self, info: &ConnectionInfo) -> Result<(), DirectoryError>;

    async fn remove(&self, client_id: &str) -> Result<(), DirectoryError>;

    /// Remove every listed client in one round trip.
    async fn remove_all(&self, client_ids: &[String]) -> Result<(), DirectoryError>;
}

fn session_key(client_id: &str) -> String {
    format!("messaging:sessions:{client_id}")
}

fn map_redis_error(err: redis::RedisError) -> DirectoryError {
    DirectoryError::Io(err.to_string())
}

/// Redis-backed directory: one hash per client under
/// `messaging:sessions:{client_id}`.
pub struct RedisDirectory {
    conn: ConnectionManager,
}

impl RedisDirectory {
    pub async fn connect(client: redis::Client) -> Result<Self, DirectoryError> {
        let conn = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Directory for RedisDirectory {
    async fn get(&self, client_id: &str) -> Result<Option<ConnectionInfo>, DirectoryError> {
        let mut conn = self.conn.clone();
        let (cid, sid): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(session_key(client_id))
            .arg(FIELD_CLIENT_ID)
            .arg(FIELD_SERVER_ID)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match (cid, sid) {
            (Some(client_id), Some(server_id)) => Ok(Some(ConnectionInfo {
                client_id,
                server_id,
            })),
            _ => Ok(None),
        }
    }

    async fn put(&self, info: &ConnectionInfo) -> Result<(), DirectoryError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                session_key(&info.client_id),
                &[
                    (FIELD_CLIENT_ID, info.client_id.as_str()),
                    (FIELD_SERVER_ID, info.server_id.as_str()),
                ],
            )
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> Result<(), DirectoryError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(session_key(client_id))
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn remove_all(&self, client_ids: &[String]) -> Result<(), DirectoryError> {
        if client_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for client_id in client_ids {
            pipe.del(session_key(client_id)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(())
    }
}

/// In-memory directory for tests/dev. Share one instance (via `Arc`) among
/// several messengers to simulate a fleet.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: Mutex<HashMap<String, ConnectionInfo>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn get(&self, client_id: &str) -> Result<Option<ConnectionInfo>, DirectoryError> {
        Ok(self.entries.lock().unwrap().get(client_id).cloned())
    }

    async fn put(&self, info: &ConnectionInfo) -> Result<(), DirectoryError> {
        self.entries
            .lock()
            .unwrap()
            .insert(info.client_id.clone(), info.clone());
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> Result<(), DirectoryError> {
        self.entries.lock().unwrap().remove(client_id);
        Ok(())
    }

    async fn remove_all(&self, client_ids: &[String]) -> Result<(), DirectoryError> {
        let mut entries = self.entries.lock().unwrap();
        for client_id in client_ids {
            entries.remove(client_id);
        }
        Ok(())
    }
}
