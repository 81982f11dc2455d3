//! Stream consumer: turns each delivered record into three independent writes
//! (search index, recency buffer, per-minute error counter).
//!
//! A failed write is logged and counted; it never blocks or rolls back the
//! others, and nothing is retried here. Redelivery by the stream is the only
//! retry mechanism, so duplicates inflate the buffer and counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::event_router::{PartitionRouter, PARTITION_CAPACITY};
use crate::store::Stores;
use crate::stream::{RecordSource, StreamRecord};
use crate::types::EventRecord;

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Failed,
    /// Not applicable to this record (counter step for non-ERROR events).
    Skipped,
}

impl StepOutcome {
    fn from_result<T>(res: &Result<T>) -> Self {
        if res.is_ok() {
            StepOutcome::Done
        } else {
            StepOutcome::Failed
        }
    }
}

/// Result of the three side effects for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub indexed: StepOutcome,
    pub buffered: StepOutcome,
    pub counted: StepOutcome,
}

impl RecordOutcome {
    pub fn is_complete(&self) -> bool {
        ![self.indexed, self.buffered, self.counted].contains(&StepOutcome::Failed)
    }
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    stored: AtomicU64,
    dropped: AtomicU64,
    index_failures: AtomicU64,
    buffer_failures: AtomicU64,
    counter_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub received: u64,
    /// Records whose applicable side effects all succeeded.
    pub stored: u64,
    /// Malformed records discarded before any side effect.
    pub dropped: u64,
    pub index_failures: u64,
    pub buffer_failures: u64,
    pub counter_failures: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            index_failures: self.index_failures.load(Ordering::Relaxed),
            buffer_failures: self.buffer_failures.load(Ordering::Relaxed),
            counter_failures: self.counter_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Clone)]
pub struct IngestPipeline {
    stores: Stores,
    stats: Arc<IngestStats>,
}

impl IngestPipeline {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Decode one stream record and apply its side effects.
    /// Returns `None` when the payload is malformed and was dropped.
    pub async fn handle(&self, record: &StreamRecord) -> Option<RecordOutcome> {
        IngestStats::bump(&self.stats.received);
        let event = match EventRecord::from_slice(&record.payload) {
            Ok(event) => event,
            Err(err) => {
                IngestStats::bump(&self.stats.dropped);
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    "dropping malformed record: {err}"
                );
                return None;
            }
        };
        Some(self.store(&event).await)
    }

    /// Index, buffer, then count, in that fixed order.
    pub async fn store(&self, event: &EventRecord) -> RecordOutcome {
        let res = self.stores.index.upsert(event).await;
        let indexed = self.settle(event, "index", &self.stats.index_failures, &res);

        let res = self.stores.recent.push_front(event).await;
        let buffered = self.settle(event, "recent", &self.stats.buffer_failures, &res);

        let counted = if event.is_error() {
            let res = match event.minute_bucket() {
                Ok(bucket) => self.stores.errors.increment(&bucket).await,
                Err(err) => Err(err.into()),
            };
            self.settle(event, "error_count", &self.stats.counter_failures, &res)
        } else {
            StepOutcome::Skipped
        };

        let outcome = RecordOutcome {
            indexed,
            buffered,
            counted,
        };
        if outcome.is_complete() {
            IngestStats::bump(&self.stats.stored);
            info!(id = %event.id, severity = %event.severity, "consumed & stored");
        }
        outcome
    }

    fn settle<T>(
        &self,
        event: &EventRecord,
        step: &'static str,
        failures: &AtomicU64,
        res: &Result<T>,
    ) -> StepOutcome {
        if let Err(err) = res {
            IngestStats::bump(failures);
            error!(id = %event.id, step, "side effect failed: {err:#}");
        }
        StepOutcome::from_result(res)
    }
}

// ============================================================================
// Consumer loop
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub partition_buffer: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            partition_buffer: PARTITION_CAPACITY,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
        }
    }
}

pub struct IngestConsumer {
    pipeline: IngestPipeline,
    stores: Stores,
    opts: ConsumerOptions,
}

impl IngestConsumer {
    pub fn new(stores: Stores, opts: ConsumerOptions) -> Self {
        Self {
            pipeline: IngestPipeline::new(stores.clone()),
            stores,
            opts,
        }
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.pipeline.stats()
    }

    /// Create the search index if needed. Failure here is fatal for the consumer.
    pub async fn prepare(&self) -> Result<()> {
        let created = self
            .stores
            .index
            .ensure_schema()
            .await
            .context("ensuring search index schema")?;
        info!(created, "search index ready");
        Ok(())
    }

    /// `prepare`, then `run` until the source ends or shutdown is requested.
    pub async fn start<S: RecordSource>(
        &self,
        source: S,
        shutdown: CancellationToken,
    ) -> Result<IngestSnapshot> {
        self.prepare().await?;
        Ok(self.run(source, shutdown).await)
    }

    /// Pull records and hand them to per-partition workers.
    ///
    /// On shutdown, stops pulling and lets each worker finish its in-flight
    /// record. When the source is exhausted, workers drain their queues first.
    pub async fn run<S: RecordSource>(
        &self,
        mut source: S,
        shutdown: CancellationToken,
    ) -> IngestSnapshot {
        let mut router = PartitionRouter::new(
            self.pipeline.clone(),
            source.acker(),
            self.opts.partition_buffer,
            shutdown.clone(),
        );
        let mut backoff = self.opts.backoff_base;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = source.recv() => next,
            };

            match next {
                Ok(Some(record)) => {
                    backoff = self.opts.backoff_base;
                    let (partition, offset) = (record.partition, record.offset);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        res = router.route(record) => {
                            if let Err(err) = res {
                                error!(partition, offset, "could not route record: {err:#}");
                            }
                        }
                    }
                }
                Ok(None) => {
                    info!("record source exhausted");
                    break;
                }
                Err(err) => {
                    warn!("stream receive error, retrying in {:?}: {err:#}", backoff);
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.opts.backoff_max);
                }
            }
        }

        let partitions = router.partitions();
        router.shutdown().await;

        let snapshot = self.pipeline.stats().snapshot();
        info!(
            ?partitions,
            received = snapshot.received,
            stored = snapshot.stored,
            dropped = snapshot.dropped,
            index_failures = snapshot.index_failures,
            buffer_failures = snapshot.buffer_failures,
            counter_failures = snapshot.counter_failures,
            "consumer stopped"
        );
        snapshot
    }
}
