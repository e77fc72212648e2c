//! Read-through cache with pattern-based invalidation.
//!
//! The cache is advisory: any discrepancy between cache and store resolves
//! in favor of the store, and services only invalidate after a durable
//! commit. Backends are swappable through [`CacheBackend`]; the in-memory
//! implementation doubles as the test double.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

/// Cache key conventions. Everything is namespaced so pattern invalidation
/// can sweep a tenant's derived data without touching other tenants.
pub mod keys {
    use uuid::Uuid;

    pub fn invoice(invoice_id: Uuid) -> String {
        format!("invoice:{invoice_id}")
    }

    /// Matches every list/summary entry derived from one user's invoices.
    pub fn user_invoices_pattern(user_id: Uuid) -> String {
        format!("invoices:{user_id}:*")
    }

    pub fn invoice_list(user_id: Uuid, page: u64, per_page: u64) -> String {
        format!("invoices:{user_id}:list:{page}:{per_page}")
    }

    pub fn invoice_summary(user_id: Uuid) -> String {
        format!("invoices:{user_id}:summary")
    }

    pub fn analytics(user_id: Uuid) -> String {
        format!("analytics:{user_id}")
    }
}

#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
    /// Delete every key matching a glob-style pattern (`*` wildcard).
    async fn invalidate_pattern(&self, pattern: &str) -> Result<(), CacheError>;
}

/// Fetch and deserialize a JSON value. Usable through `dyn CacheBackend`.
pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn CacheBackend,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON value with an optional TTL.
pub async fn set_json<T: Serialize>(
    cache: &dyn CacheBackend,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, &raw, ttl).await
}

/// Glob match supporting `*` only, which is all our key patterns use.
fn glob_match(pattern: &str, key: &str) -> bool {
    fn inner(p: &[u8], k: &[u8]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], k) || (!k.is_empty() && inner(p, &k[1..])),
            (Some(pc), Some(kc)) if pc == kc => inner(&p[1..], &k[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), key.as_bytes())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

/// In-memory cache used in tests and as fallback when Redis is unreachable.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let expired = {
            let store = self.store.read().unwrap();
            match store.get(key) {
                Some(entry) if entry.is_expired() => true,
                Some(entry) => return Ok(Some(entry.value.clone())),
                None => return Ok(None),
            }
        };
        if expired {
            self.store.write().unwrap().remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut store = self.store.write().unwrap();
        store.insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.write().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let store = self.store.read().unwrap();
        Ok(store.get(key).is_some_and(|entry| !entry.is_expired()))
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<(), CacheError> {
        let mut store = self.store.write().unwrap();
        store.retain(|key, _| !glob_match(pattern, key));
        Ok(())
    }
}

/// Redis-backed cache. Connections are created per call via the shared
/// client; the SCAN loop mirrors production pattern invalidation.
#[derive(Clone)]
pub struct RedisCache {
    client: Arc<redis::Client>,
}

impl RedisCache {
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self { client }
    }

    async fn conn(&self) -> Result<redis::aio::Connection, CacheError> {
        Ok(self.client.get_async_connection().await?)
    }
}

#[async_trait::async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(ttl.as_secs())
                    .arg(value)
                    .query_async::<_, ()>(&mut conn)
                    .await?
            }
            None => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async::<_, ()>(&mut conn)
                    .await?
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let n: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }
}

/// Selects a backend from configuration, falling back to in-memory when the
/// Redis URL is absent or unusable.
pub struct CacheFactory;

impl CacheFactory {
    pub fn create(cache_type: &str, redis_client: Option<Arc<redis::Client>>) -> Arc<dyn CacheBackend> {
        match (cache_type, redis_client) {
            ("redis", Some(client)) => Arc::new(RedisCache::new(client)),
            ("redis", None) => {
                warn!("Redis cache requested but no client available; using in-memory cache");
                Arc::new(InMemoryCache::new())
            }
            _ => Arc::new(InMemoryCache::new()),
        }
    }
}
