//! Redis list holding the most recently ingested events, newest at the head.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::AsyncCommands;

use crate::store::RecencyBuffer;
use crate::types::EventRecord;

#[derive(Clone)]
pub struct RedisRecencyBuffer<C = ConnectionManager> {
    conn: C,
    key: Arc<str>,
    capacity: usize,
}

impl<C> RedisRecencyBuffer<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    pub fn new(conn: C, key: impl Into<Arc<str>>, capacity: usize) -> Self {
        Self {
            conn,
            key: key.into(),
            capacity: capacity.max(1),
        }
    }
}

/// Inclusive `LRANGE`/`LTRIM` stop index covering the first `n` entries.
pub fn last_index(n: usize) -> isize {
    isize::try_from(n).unwrap_or(isize::MAX).saturating_sub(1)
}

#[async_trait]
impl<C> RecencyBuffer for RedisRecencyBuffer<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn push_front(&self, record: &EventRecord) -> Result<()> {
        let payload = serde_json::to_string(record).context("serializing recent event")?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lpush(&*self.key, payload)
            .ignore()
            .ltrim(&*self.key, 0, last_index(self.capacity))
            .ignore()
            .query_async(&mut conn)
            .await
            .with_context(|| format!("pushing to {}", self.key))?;
        Ok(())
    }

    async fn read_top(&self, k: usize) -> Result<Vec<String>> {
        // LRANGE 0 -1 would return the whole list.
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn
            .lrange(&*self.key, 0, last_index(k))
            .await
            .with_context(|| format!("reading {}", self.key))?;
        Ok(items)
    }
}
