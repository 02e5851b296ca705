use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Key under which cancellation is requested for a job
pub fn cancel_key(job_id: &str) -> String {
    format!("texd:cancel:{job_id}")
}

/// Key holding the worker process heartbeat
pub const HEARTBEAT_KEY: &str = "texd:heartbeat";

/// Time-bounded key/value store shared between runner processes. Backs the
/// cancellation flags and the heartbeat record; expiry is native to the
/// backend so a dead process leaves nothing behind.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Reads and deletes in one step; a raised flag is consumed by its first
    /// observer
    async fn take(&self, key: &str) -> Result<Option<String>>;
    /// Deletes only when the stored value still matches `value`
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool>;
}

/// In-process store with lazy expiry, for development and tests
#[derive(Default)]
pub struct MemoryStore {
    entries: parking_lot::Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some((_, deadline)) if deadline <= Instant::now() => Ok(None),
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((stored, deadline)) if *deadline > Instant::now() && stored == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Redis-backed store, the production backend
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(key, value, seconds)
            .await
            .context("shared store set_ex failed")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.context("shared store get failed")
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("shared store getdel failed")
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(
            r"if redis.call('get', KEYS[1]) == ARGV[1] then
                  return redis.call('del', KEYS[1])
              else
                  return 0
              end",
        );
        let deleted: i64 = script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .context("shared store conditional delete failed")?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn take_consumes_on_first_observation() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.take("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.take("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn del_if_eq_spares_foreign_values() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "mine", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!store.del_if_eq("k", "other").await.unwrap());
        assert!(store.del_if_eq("k", "mine").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
