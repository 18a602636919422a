//! Read-through cache service with explicit invalidation.
//!
//! Entity reads are cached under exact keys; derived aggregates (feeds,
//! message counts) are cached under prefix-scoped "query" keys so a single
//! mutation can drop every stale aggregate at once.

use crate::types::{EnvironmentId, SubscriberId, WorkflowId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Key/value cache contract shared by all workers.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration);
    async fn invalidate_by_key(&self, key: &str);
    /// Drop every key starting with the given prefix.
    async fn invalidate_by_pattern(&self, prefix: &str);
}

/// Pure cache-key builders, scoped by environment so tenants never collide.
pub struct CacheKey;

impl CacheKey {
    /// Exact key for a subscriber entity.
    pub fn subscriber(env: &EnvironmentId, subscriber: &SubscriberId) -> String {
        format!("entity:{}:subscriber:{}", env.0, subscriber)
    }

    /// Exact key for a subscriber's resolved preference set on one workflow.
    pub fn preferences(
        env: &EnvironmentId,
        subscriber: &SubscriberId,
        workflow: &WorkflowId,
    ) -> String {
        format!("entity:{}:preferences:{}:{}", env.0, subscriber, workflow)
    }

    /// Exact key for a workflow definition, by trigger identifier.
    pub fn workflow(env: &EnvironmentId, trigger_identifier: &str) -> String {
        format!("entity:{}:workflow:{}", env.0, trigger_identifier)
    }

    /// Key for one derived query (feed, message count) of a subscriber.
    pub fn query(env: &EnvironmentId, subscriber: &SubscriberId, kind: &str) -> String {
        format!("{}{}", Self::query_prefix(env, subscriber), kind)
    }

    /// Prefix covering every derived query of a subscriber, for
    /// pattern invalidation.
    pub fn query_prefix(env: &EnvironmentId, subscriber: &SubscriberId) -> String {
        format!("query:{}:{}:", env.0, subscriber)
    }
}

/// Read-through wrapper: serve from cache when present, otherwise run the
/// fetch and store its result under the given key.
pub async fn cached_query<T, F, Fut>(
    cache: &dyn Cache,
    key: &str,
    ttl: Duration,
    fetch: F,
) -> anyhow::Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if let Some(hit) = cache.get(key).await {
        match serde_json::from_value(hit) {
            Ok(value) => {
                debug!(key = %key, "cache hit");
                return Ok(value);
            }
            Err(e) => {
                // Stale shape; drop and fall through to the fetch
                debug!(key = %key, error = %e, "cache entry undecodable, invalidating");
                cache.invalidate_by_key(key).await;
            }
        }
    }

    let value = fetch().await?;
    cache
        .set(key, serde_json::to_value(&value)?, ttl)
        .await;
    Ok(value)
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// In-memory cache with per-entry TTL.
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn invalidate_by_key(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    async fn invalidate_by_pattern(&self, prefix: &str) {
        self.entries
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
    }
}
