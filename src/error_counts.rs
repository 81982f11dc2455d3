//! Per-minute ERROR counters in Redis, each key expiring after the retention window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::AsyncCommands;

use crate::store::ErrorCounterStore;
use crate::time_windows::MinuteBucket;

/// 48 hours.
pub const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(60 * 60 * 48);

#[derive(Clone)]
pub struct RedisErrorCounters<C = ConnectionManager> {
    conn: C,
    prefix: Arc<str>,
    ttl: Duration,
}

impl<C> RedisErrorCounters<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    pub fn new(conn: C, prefix: impl Into<Arc<str>>, ttl: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn key_for(&self, bucket: &MinuteBucket) -> String {
        bucket.key(&self.prefix)
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX).max(1)
    }
}

#[async_trait]
impl<C> ErrorCounterStore for RedisErrorCounters<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn increment(&self, bucket: &MinuteBucket) -> Result<u64> {
        let key = self.key_for(bucket);
        let mut conn = self.conn.clone();
        let (count, _armed): (u64, i64) = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .expire(&key, self.ttl_secs())
            .query_async(&mut conn)
            .await
            .with_context(|| format!("incrementing {key}"))?;
        Ok(count)
    }

    async fn get(&self, bucket: &MinuteBucket) -> Result<u64> {
        let key = self.key_for(bucket);
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn
            .get(&key)
            .await
            .with_context(|| format!("reading {key}"))?;
        Ok(count.unwrap_or(0))
    }
}
