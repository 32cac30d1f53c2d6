//! Probabilistic existence filter in front of the product store.
//!
//! A negative answer short-circuits the read path to NotFound without a
//! backend round-trip. The filter lives in the shared cache so every node
//! sees one membership set; startup bootstraps it behind a sentinel
//! member check.

use app_config::FilterKind;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::CacheError;

/// Member inserted at creation time so later boots can tell an existing
/// filter from a missing one.
const SENTINEL: &str = "__sentinel__";

/// Existence filter contract. `might_contain` may report false positives
/// but never false negatives.
#[async_trait]
pub trait ExistenceFilter: Send + Sync {
    /// Idempotent single-shot setup: create the filter unless the
    /// sentinel member is already present.
    async fn init(&self) -> Result<(), CacheError>;

    async fn might_contain(&self, member: u64) -> Result<bool, CacheError>;

    async fn insert(&self, member: u64) -> Result<(), CacheError>;

    /// Removes a member where the filter supports deletion. Bloom filters
    /// do not; the call is a no-op there and the read path accepts the
    /// resulting false positive.
    async fn remove(&self, member: u64) -> Result<(), CacheError>;
}

/// Redis module backed filter (`BF.*` / `CF.*` command families).
pub struct RedisExistenceFilter {
    conn: ConnectionManager,
    kind: FilterKind,
    name: String,
    capacity: u64,
    error_rate: f64,
}

impl RedisExistenceFilter {
    pub fn new(
        conn: ConnectionManager,
        kind: FilterKind,
        name: impl Into<String>,
        capacity: u64,
        error_rate: f64,
    ) -> Self {
        Self {
            conn,
            kind,
            name: name.into(),
            capacity,
            error_rate,
        }
    }

    fn exists_cmd(&self) -> &'static str {
        match self.kind {
            FilterKind::Cuckoo => "CF.EXISTS",
            _ => "BF.EXISTS",
        }
    }

    fn add_cmd(&self) -> &'static str {
        match self.kind {
            FilterKind::Cuckoo => "CF.ADD",
            _ => "BF.ADD",
        }
    }
}

#[async_trait]
impl ExistenceFilter for RedisExistenceFilter {
    async fn init(&self) -> Result<(), CacheError> {
        if self.kind == FilterKind::None {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let sentinel_present: bool = redis::cmd(self.exists_cmd())
            .arg(&self.name)
            .arg(SENTINEL)
            .query_async(&mut conn)
            .await?;
        if sentinel_present {
            return Ok(());
        }

        let reserve = match self.kind {
            FilterKind::Cuckoo => {
                let mut cmd = redis::cmd("CF.RESERVE");
                cmd.arg(&self.name).arg(self.capacity);
                cmd
            }
            _ => {
                let mut cmd = redis::cmd("BF.RESERVE");
                cmd.arg(&self.name).arg(self.error_rate).arg(self.capacity);
                cmd
            }
        };
        // Another node may have created the filter between the sentinel
        // check and the reserve; that race is benign.
        let reserved: Result<(), redis::RedisError> = reserve.query_async(&mut conn).await;
        match reserved {
            Ok(()) => info!(filter = %self.name, kind = ?self.kind, "existence filter created"),
            Err(e) => {
                let already_exists = e
                    .detail()
                    .is_some_and(|detail| detail.to_lowercase().contains("exists"));
                if !already_exists {
                    return Err(e.into());
                }
            }
        }

        let _added: bool = redis::cmd(self.add_cmd())
            .arg(&self.name)
            .arg(SENTINEL)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn might_contain(&self, member: u64) -> Result<bool, CacheError> {
        if self.kind == FilterKind::None {
            return Ok(true);
        }
        let mut conn = self.conn.clone();
        let present: bool = redis::cmd(self.exists_cmd())
            .arg(&self.name)
            .arg(member.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(present)
    }

    async fn insert(&self, member: u64) -> Result<(), CacheError> {
        if self.kind == FilterKind::None {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _added: bool = redis::cmd(self.add_cmd())
            .arg(&self.name)
            .arg(member.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, member: u64) -> Result<(), CacheError> {
        // Only cuckoo filters can delete; see trait docs.
        if self.kind != FilterKind::Cuckoo {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _removed: bool = redis::cmd("CF.DEL")
            .arg(&self.name)
            .arg(member.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
