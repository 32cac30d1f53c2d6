//! Tier-2 shared cache over Redis.
//!
//! Besides plain get/set/delete with jittered TTLs, this tier hosts the
//! distributed mutex used for single-flight loading and the pipelined,
//! exists-guarded counter adjustments issued after inventory writes.

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use std::time::Duration;
use uuid::Uuid;

use crate::CacheError;

/// Lease of the single-flight mutex. If the holder dies the lease expires
/// and another caller may proceed.
const MUTEX_LEASE: Duration = Duration::from_secs(5);

/// Upper bound of the jitter added to every TTL. TTLs must never be
/// uniform or a mass expiry turns into a load stampede.
const TTL_JITTER_MAX_SECS: u64 = 10;

/// Adjusts the counter only when the key is already cached; populating a
/// stale zero through INCRBY would poison the read path.
const ADJUST_IF_EXISTS: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return redis.call("INCRBY", KEYS[1], ARGV[1])
end
return nil
"#;

/// Compare-and-delete unlock; only the token holder may release.
const UNLOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// One counter adjustment in a pipelined batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterOp {
    pub key: String,
    pub delta: i64,
}

/// Shared cache tier. Implementations must be safe for concurrent use
/// from many tasks and processes.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Stores `val` under `key` with the configured base TTL plus jitter.
    async fn set(&self, key: &str, val: String) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Applies all `ops` in one round-trip. The per-op result is the new
    /// counter value, or `None` when the key was absent and the
    /// adjustment skipped.
    async fn adjust_counters(
        &self,
        ops: &[CounterOp],
    ) -> Result<Vec<Option<i64>>, CacheError>;

    /// Tries to take the named mutex once. Returns the unlock token on
    /// success, `None` when another holder owns the lease.
    async fn try_lock(&self, name: &str) -> Result<Option<String>, CacheError>;

    /// Releases the named mutex if `token` still owns it.
    async fn unlock(&self, name: &str, token: &str) -> Result<(), CacheError>;
}

/// Redis-backed implementation over a shared connection manager.
#[derive(Clone)]
pub struct RedisSharedCache {
    conn: ConnectionManager,
    base_ttl: Duration,
}

impl RedisSharedCache {
    pub fn new(conn: ConnectionManager, base_ttl: Duration) -> Self {
        Self { conn, base_ttl }
    }

    fn jittered_ttl_secs(&self) -> u64 {
        self.base_ttl.as_secs() + rand::thread_rng().gen_range(0..TTL_JITTER_MAX_SECS)
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let val: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(val)
    }

    async fn set(&self, key: &str, val: String) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(val)
            .arg("EX")
            .arg(self.jittered_ttl_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn adjust_counters(
        &self,
        ops: &[CounterOp],
    ) -> Result<Vec<Option<i64>>, CacheError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for op in ops {
            pipe.cmd("EVAL")
                .arg(ADJUST_IF_EXISTS)
                .arg(1)
                .arg(&op.key)
                .arg(op.delta);
        }
        let results: Vec<Option<i64>> = pipe.query_async(&mut conn).await?;
        Ok(results)
    }

    async fn try_lock(&self, name: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().to_string();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(MUTEX_LEASE.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| token))
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _released: i64 = redis::Script::new(UNLOCK)
            .key(name)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
