//! Tier-1 in-process cache.

use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;

/// In-process cache of JSON-encoded values. Entries expire by TTL; cross
/// node invalidation relies on that expiry, so the TTL here bounds the
/// staleness window of every node.
#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, val: String);
    async fn delete(&self, key: &str);
}

/// moka-backed implementation.
pub struct MokaLocalCache {
    cache: Cache<String, String>,
}

impl MokaLocalCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(capacity)
                .build(),
        }
    }
}

#[async_trait]
impl LocalCache for MokaLocalCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key).await
    }

    async fn set(&self, key: &str, val: String) {
        self.cache.insert(key.to_string(), val).await;
    }

    async fn delete(&self, key: &str) {
        self.cache.invalidate(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MokaLocalCache::new(Duration::from_secs(10), 100);
        assert!(cache.get("k").await.is_none());
        cache.set("k", "v".to_string()).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        cache.delete("k").await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MokaLocalCache::new(Duration::from_millis(50), 100);
        cache.set("k", "v".to_string()).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("k").await.is_none());
    }
}
