//! In-process store implementations.
//! Same contracts as the Elasticsearch/Redis backends; used by tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::store::{ErrorCounterStore, RecencyBuffer, SearchIndex, SearchPage};
use crate::time_windows::MinuteBucket;
use crate::types::EventRecord;

// ============================================================================
// Search index
// ============================================================================

#[derive(Default)]
pub struct MemorySearchIndex {
    docs: Mutex<HashMap<String, EventRecord>>,
    schema_ready: Mutex<bool>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<EventRecord> {
        self.docs.lock().get(id).cloned()
    }

    pub fn has_schema(&self) -> bool {
        *self.schema_ready.lock()
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Any query term hits a message token (case-folded), or the whole query equals
/// a keyword field exactly.
fn record_matches(record: &EventRecord, query: &str) -> bool {
    if query == record.service || query == record.severity.as_str() {
        return true;
    }
    let terms: Vec<String> = tokens(query).collect();
    tokens(&record.message).any(|t| terms.contains(&t))
}

fn sort_key(record: &EventRecord) -> Option<DateTime<Utc>> {
    record.event_time().ok()
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn ensure_schema(&self) -> Result<bool> {
        let mut ready = self.schema_ready.lock();
        let created = !*ready;
        *ready = true;
        Ok(created)
    }

    async fn upsert(&self, record: &EventRecord) -> Result<()> {
        self.docs.lock().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<SearchPage> {
        let query = query.trim();
        let mut hits: Vec<EventRecord> = self
            .docs
            .lock()
            .values()
            .filter(|r| query.is_empty() || record_matches(r, query))
            .cloned()
            .collect();
        hits.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
        let total = hits.len() as u64;
        hits.truncate(limit);
        Ok(SearchPage { total, hits })
    }
}

// ============================================================================
// Recency buffer
// ============================================================================

pub struct MemoryRecencyBuffer {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl MemoryRecencyBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a raw entry, bypassing serialization.
    pub fn push_raw(&self, raw: impl Into<String>) {
        let mut entries = self.entries.lock();
        entries.push_front(raw.into());
        entries.truncate(self.capacity);
    }
}

#[async_trait]
impl RecencyBuffer for MemoryRecencyBuffer {
    async fn push_front(&self, record: &EventRecord) -> Result<()> {
        let payload = serde_json::to_string(record).context("serializing recent event")?;
        self.push_raw(payload);
        Ok(())
    }

    async fn read_top(&self, k: usize) -> Result<Vec<String>> {
        Ok(self.entries.lock().iter().take(k).cloned().collect())
    }
}

// ============================================================================
// Error counters
// ============================================================================

struct Counter {
    count: u64,
    expires_at: Instant,
}

pub struct MemoryErrorCounters {
    counters: Mutex<HashMap<MinuteBucket, Counter>>,
    ttl: Duration,
}

impl MemoryErrorCounters {
    pub fn new(ttl: Duration) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Buckets still alive, with their counts.
    pub fn live_buckets(&self) -> Vec<(MinuteBucket, u64)> {
        let now = Instant::now();
        let mut live: Vec<_> = self
            .counters
            .lock()
            .iter()
            .filter(|(_, c)| c.expires_at > now)
            .map(|(b, c)| (b.clone(), c.count))
            .collect();
        live.sort();
        live
    }
}

#[async_trait]
impl ErrorCounterStore for MemoryErrorCounters {
    async fn increment(&self, bucket: &MinuteBucket) -> Result<u64> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        counters.retain(|_, c| c.expires_at > now);
        let counter = counters.entry(bucket.clone()).or_insert(Counter {
            count: 0,
            expires_at: now,
        });
        counter.count += 1;
        counter.expires_at = now + self.ttl;
        Ok(counter.count)
    }

    async fn get(&self, bucket: &MinuteBucket) -> Result<u64> {
        let now = Instant::now();
        Ok(self
            .counters
            .lock()
            .get(bucket)
            .filter(|c| c.expires_at > now)
            .map(|c| c.count)
            .unwrap_or(0))
    }
}
