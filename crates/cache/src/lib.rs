//! Two-tier read-path cache in front of the participant stores.
//!
//! Tier-1 is an in-process TTL cache, tier-2 a shared Redis cache. Reads
//! go tier-1 → existence filter → tier-2 → single-flight loader; writes go
//! to the store first and are mirrored into the shared tier (or pipelined
//! as counter adjustments for inventory). The distributed mutex behind the
//! single-flight is shared-cache backed because concurrent callers may
//! live in different processes.

pub mod filter;
pub mod local;
pub mod proxy;
pub mod redis_cache;

pub use filter::{ExistenceFilter, RedisExistenceFilter};
pub use local::{LocalCache, MokaLocalCache};
pub use proxy::{OrderRepoCache, PaymentRepoCache, ProductRepoCache};
pub use redis_cache::{CounterOp, RedisSharedCache, SharedCache};

use thiserror::Error;

/// Cache-layer error. On the read path these are logged and the request
/// falls through to the backing store; they never fail a user request by
/// themselves.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Cache key layout. One function per keyspace so the format strings live
/// in exactly one place.
pub mod key {
    pub fn product_check(id: u64) -> String {
        format!("productcheck:{id}")
    }

    pub fn product_detail(id: u64) -> String {
        format!("productdetail:{id}")
    }

    pub fn product_inventory(id: u64) -> String {
        format!("productinventory:{id}")
    }

    pub fn order(id: u64) -> String {
        format!("order:{id}")
    }

    pub fn payment(id: u64) -> String {
        format!("payment:{id}")
    }

    pub fn mutex(key: &str) -> String {
        format!("mutex:{key}")
    }
}
