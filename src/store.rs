//! Storage contracts the ingestion pipeline and query layer are written against.
//! Each backend fails independently; callers decide what a failure means.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::time_windows::MinuteBucket;
use crate::types::EventRecord;

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    pub total: u64,
    pub hits: Vec<EventRecord>,
}

/// Document store keyed by event id.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index with the expected mapping if it is absent.
    /// Returns `true` when the index was created by this call.
    async fn ensure_schema(&self) -> Result<bool>;

    /// Create or fully replace the document stored under `record.id`.
    /// Not retried internally; the write becomes searchable on the next refresh.
    async fn upsert(&self, record: &EventRecord) -> Result<()>;

    /// Multi-field match over message/service/severity, newest first.
    /// An empty query matches every document.
    async fn search(&self, query: &str, limit: usize) -> Result<SearchPage>;
}

/// Bounded, most-recent-first list of raw events.
#[async_trait]
pub trait RecencyBuffer: Send + Sync {
    /// Insert at the head and evict from the tail down to capacity.
    async fn push_front(&self, record: &EventRecord) -> Result<()>;

    /// Up to `k` most recently pushed entries, head first, as stored.
    async fn read_top(&self, k: usize) -> Result<Vec<String>>;
}

/// Per-minute counters of ERROR events with a retention TTL.
#[async_trait]
pub trait ErrorCounterStore: Send + Sync {
    /// Increment the bucket (creating it at 1) and re-arm its TTL.
    /// Returns the count after the increment.
    async fn increment(&self, bucket: &MinuteBucket) -> Result<u64>;

    /// Current count, or 0 when absent or expired.
    async fn get(&self, bucket: &MinuteBucket) -> Result<u64>;
}

/// The three derived stores, injected into the consumer and the query service.
#[derive(Clone)]
pub struct Stores {
    pub index: Arc<dyn SearchIndex>,
    pub recent: Arc<dyn RecencyBuffer>,
    pub errors: Arc<dyn ErrorCounterStore>,
}

impl Stores {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        recent: Arc<dyn RecencyBuffer>,
        errors: Arc<dyn ErrorCounterStore>,
    ) -> Self {
        Self {
            index,
            recent,
            errors,
        }
    }
}
