//! Shared key-value store used for the hot cache, throttling, and crawler
//! cooldown windows.
//!
//! The store must be visible to every process replica, so the production
//! implementation is Redis. `MemoryStore` implements the same contract for
//! tests and single-process runs. The throttler's read-modify-write is
//! atomic in both: a server-side Lua script on Redis, a single mutex here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Value stored for an accessor that returned nothing, so repeated lookups
/// do not re-hit the exchange until the TTL elapses.
pub const NEGATIVE_SENTINEL: &str = "null";

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomic throttle primitive: if no stamp exists for `key`, or the stored
    /// stamp is at least `period_sec` older than `now_sec`, store `now_sec`
    /// (entry TTL `2 * period_sec`) and return true. Otherwise return false.
    async fn check_and_stamp(&self, key: &str, now_sec: f64, period_sec: f64) -> Result<bool>;

    /// Seconds stored by the last successful `check_and_stamp`, if any.
    async fn last_stamp(&self, key: &str) -> Result<Option<f64>>;
}

pub type SharedStore = Arc<dyn KvStore>;

// Allow if key missing or (now - last) >= period; then stamp now and expire.
const CHECK_AND_STAMP_SCRIPT: &str = r#"
local key = KEYS[1]
local now_sec = tonumber(ARGV[1])
local period_sec = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])
local last = redis.call('GET', key)
if last == false then
  redis.call('SET', key, now_sec)
  redis.call('PEXPIRE', key, ttl_ms)
  return 1
end
local last_sec = tonumber(last)
if (now_sec - last_sec) >= period_sec then
  redis.call('SET', key, now_sec)
  redis.call('PEXPIRE', key, ttl_ms)
  return 1
end
return 0
"#;

/// Redis-backed store. Cheap to clone; the connection manager multiplexes.
#[derive(Clone)]
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
    script: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .context("redis connect failed")?;
        Ok(Self {
            manager,
            script: redis::Script::new(CHECK_AND_STAMP_SCRIPT),
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::AsyncCommands::get(&mut conn, key).await?;
        Ok(raw)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::AsyncCommands::set_ex(&mut conn, key, value, ttl_secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::AsyncCommands::del(&mut conn, key).await?;
        Ok(())
    }

    async fn check_and_stamp(&self, key: &str, now_sec: f64, period_sec: f64) -> Result<bool> {
        let mut conn = self.manager.clone();
        let ttl_ms = (period_sec * 2.0 * 1000.0) as i64;
        let passed: i32 = self
            .script
            .key(key)
            .arg(now_sec)
            .arg(period_sec)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(passed == 1)
    }

    async fn last_stamp(&self, key: &str) -> Result<Option<f64>> {
        let raw = self.get(key).await?;
        Ok(raw.and_then(|s| s.parse::<f64>().ok()))
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// Single-process store with the same semantics as `RedisStore`.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    fn live_value(entries: &mut HashMap<String, MemoryEntry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.map_or(false, |at| Instant::now() >= at) {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn check_and_stamp(&self, key: &str, now_sec: f64, period_sec: f64) -> Result<bool> {
        let mut entries = self.entries.lock();
        let last = Self::live_value(&mut entries, key).and_then(|v| v.parse::<f64>().ok());
        let allowed = match last {
            None => true,
            Some(last_sec) => now_sec - last_sec >= period_sec,
        };
        if allowed {
            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value: now_sec.to_string(),
                    expires_at: Some(Instant::now() + Duration::from_secs_f64(period_sec * 2.0)),
                },
            );
        }
        Ok(allowed)
    }

    async fn last_stamp(&self, key: &str) -> Result<Option<f64>> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key).and_then(|v| v.parse::<f64>().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_get_set() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());
        store.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_expiry() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 0).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_check_and_stamp_is_period_sparse() {
        let store = MemoryStore::new();
        assert!(store.check_and_stamp("t", 100.0, 1.0).await.unwrap());
        assert!(!store.check_and_stamp("t", 100.5, 1.0).await.unwrap());
        assert!(!store.check_and_stamp("t", 100.99, 1.0).await.unwrap());
        assert!(store.check_and_stamp("t", 101.0, 1.0).await.unwrap());
        assert_eq!(store.last_stamp("t").await.unwrap(), Some(101.0));
    }
}
