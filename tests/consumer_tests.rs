//! Tests for the ingestion pipeline and consumer loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use logtrail::consumer::{ConsumerOptions, IngestConsumer, IngestPipeline, StepOutcome};
use logtrail::memory::{MemoryErrorCounters, MemoryRecencyBuffer, MemorySearchIndex};
use logtrail::query::{QueryLimits, QueryService};
use logtrail::store::{ErrorCounterStore, SearchIndex, SearchPage, Stores};
use logtrail::stream::{AckLog, Acknowledge, ChannelSource, RecordSource, StreamRecord};
use logtrail::time_windows::MinuteBucket;
use logtrail::types::EventRecord;
use tokio_util::sync::CancellationToken;

struct Harness {
    index: Arc<MemorySearchIndex>,
    recent: Arc<MemoryRecencyBuffer>,
    errors: Arc<MemoryErrorCounters>,
}

impl Harness {
    fn new() -> Self {
        Self {
            index: Arc::new(MemorySearchIndex::new()),
            recent: Arc::new(MemoryRecencyBuffer::new(100)),
            errors: Arc::new(MemoryErrorCounters::new(Duration::from_secs(48 * 3600))),
        }
    }

    fn stores(&self) -> Stores {
        Stores::new(self.index.clone(), self.recent.clone(), self.errors.clone())
    }
}

struct FailingIndex;

#[async_trait]
impl SearchIndex for FailingIndex {
    async fn ensure_schema(&self) -> Result<bool> {
        anyhow::bail!("cluster unreachable")
    }

    async fn upsert(&self, _record: &EventRecord) -> Result<()> {
        anyhow::bail!("cluster unreachable")
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<SearchPage> {
        anyhow::bail!("cluster unreachable")
    }
}

struct FailingCounters;

#[async_trait]
impl ErrorCounterStore for FailingCounters {
    async fn increment(&self, _bucket: &MinuteBucket) -> Result<u64> {
        anyhow::bail!("redis down")
    }

    async fn get(&self, _bucket: &MinuteBucket) -> Result<u64> {
        anyhow::bail!("redis down")
    }
}

fn event_json(id: &str, timestamp: &str, severity: &str) -> Vec<u8> {
    format!(
        r#"{{"id":"{id}","timestamp":"{timestamp}","service":"orders","severity":"{severity}","message":"x"}}"#
    )
    .into_bytes()
}

fn record(partition: i32, offset: i64, id: &str, timestamp: &str, severity: &str) -> StreamRecord {
    StreamRecord::new(partition, offset, event_json(id, timestamp, severity))
}

async fn run_to_end(stores: Stores, records: Vec<StreamRecord>) -> (Arc<AckLog>, IngestConsumer) {
    let (tx, source) = ChannelSource::channel(records.len().max(1));
    let acks = source.ack_log();
    for r in records {
        tx.send(r).await.unwrap();
    }
    drop(tx);

    let consumer = IngestConsumer::new(stores, ConsumerOptions::default());
    consumer.start(source, CancellationToken::new()).await.unwrap();
    (acks, consumer)
}

async fn wait_for_acks(acks: &AckLog, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while acks.len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("records were not acknowledged in time");
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn test_error_event_touches_all_three_stores() {
    let h = Harness::new();
    let pipeline = IngestPipeline::new(h.stores());

    let outcome = pipeline
        .handle(&record(0, 0, "a1", "2023-08-01T15:04:10Z", "ERROR"))
        .await
        .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.indexed, StepOutcome::Done);
    assert_eq!(outcome.buffered, StepOutcome::Done);
    assert_eq!(outcome.counted, StepOutcome::Done);
    assert!(h.index.get("a1").is_some());
    assert_eq!(h.recent.len(), 1);
    let m = MinuteBucket::parse("2023-08-01T15:04").unwrap();
    assert_eq!(h.errors.get(&m).await.unwrap(), 1);
}

#[tokio::test]
async fn test_non_error_event_skips_counter() {
    let h = Harness::new();
    let pipeline = IngestPipeline::new(h.stores());

    let outcome = pipeline
        .handle(&record(0, 0, "i1", "2023-08-01T15:04:10Z", "WARN"))
        .await
        .unwrap();

    assert_eq!(outcome.counted, StepOutcome::Skipped);
    assert!(outcome.is_complete());
    assert!(h.errors.live_buckets().is_empty());
}

#[tokio::test]
async fn test_malformed_record_is_dropped() {
    let h = Harness::new();
    let pipeline = IngestPipeline::new(h.stores());

    let outcome = pipeline
        .handle(&StreamRecord::new(0, 0, b"{not json".to_vec()))
        .await;

    assert!(outcome.is_none());
    assert!(h.index.is_empty());
    assert!(h.recent.is_empty());
    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.stored, 0);
}

#[tokio::test]
async fn test_index_failure_does_not_block_other_writes() {
    let h = Harness::new();
    let stores = Stores::new(Arc::new(FailingIndex), h.recent.clone(), h.errors.clone());
    let pipeline = IngestPipeline::new(stores);

    let outcome = pipeline
        .handle(&record(0, 0, "a1", "2023-08-01T15:04:10Z", "ERROR"))
        .await
        .unwrap();

    assert_eq!(outcome.indexed, StepOutcome::Failed);
    assert_eq!(outcome.buffered, StepOutcome::Done);
    assert_eq!(outcome.counted, StepOutcome::Done);
    assert!(!outcome.is_complete());

    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.index_failures, 1);
    assert_eq!(stats.stored, 0);
}

#[tokio::test]
async fn test_counter_failure_is_isolated() {
    let h = Harness::new();
    let stores = Stores::new(h.index.clone(), h.recent.clone(), Arc::new(FailingCounters));
    let pipeline = IngestPipeline::new(stores);

    let outcome = pipeline
        .handle(&record(0, 0, "a1", "2023-08-01T15:04:10Z", "ERROR"))
        .await
        .unwrap();

    assert_eq!(outcome.indexed, StepOutcome::Done);
    assert_eq!(outcome.buffered, StepOutcome::Done);
    assert_eq!(outcome.counted, StepOutcome::Failed);
    assert_eq!(pipeline.stats().snapshot().counter_failures, 1);
}

#[tokio::test]
async fn test_redelivery_overwrites_document_but_recounts() {
    let h = Harness::new();
    let pipeline = IngestPipeline::new(h.stores());
    let r = record(0, 0, "a1", "2023-08-01T15:04:10Z", "ERROR");

    pipeline.handle(&r).await.unwrap();
    pipeline.handle(&r).await.unwrap();

    assert_eq!(h.index.len(), 1);
    assert_eq!(h.recent.len(), 2);
    let m = MinuteBucket::parse("2023-08-01T15:04").unwrap();
    assert_eq!(h.errors.get(&m).await.unwrap(), 2);
}

// ============================================================================
// Consumer loop
// ============================================================================

#[tokio::test]
async fn test_error_minute_scenario() {
    let h = Harness::new();
    let (acks, consumer) = run_to_end(
        h.stores(),
        vec![
            record(0, 0, "a1", "2023-08-01T15:04:10Z", "ERROR"),
            record(0, 1, "a2", "2023-08-01T15:04:45Z", "ERROR"),
            record(0, 2, "a3", "2023-08-01T15:05:00Z", "ERROR"),
        ],
    )
    .await;

    assert_eq!(acks.acked(), vec![(0, 0), (0, 1), (0, 2)]);
    assert_eq!(consumer.stats().snapshot().stored, 3);

    let service = QueryService::new(h.stores(), QueryLimits::default());
    let c1504 = service.error_count(Some("2023-08-01T15:04")).await.unwrap();
    let c1505 = service.error_count(Some("2023-08-01T15:05")).await.unwrap();
    assert_eq!(c1504.count, 2);
    assert_eq!(c1505.count, 1);
}

#[tokio::test]
async fn test_one_corrupt_record_among_valid_ones() {
    let h = Harness::new();
    let mut records: Vec<StreamRecord> = (0..5)
        .map(|i| record(0, i, &format!("e{i}"), "2023-08-01T15:04:10Z", "INFO"))
        .collect();
    records.insert(2, StreamRecord::new(0, 99, b"corrupt".to_vec()));

    let (acks, consumer) = run_to_end(h.stores(), records).await;

    let stats = consumer.stats().snapshot();
    assert_eq!(stats.received, 6);
    assert_eq!(stats.stored, 5);
    assert_eq!(stats.dropped, 1);
    assert_eq!(h.index.len(), 5);
    assert_eq!(h.recent.len(), 5);
    // The dropped record is still acknowledged.
    assert_eq!(acks.len(), 6);
}

#[tokio::test]
async fn test_partition_order_is_preserved() {
    let h = Harness::new();
    let mut records = Vec::new();
    for offset in 0..20 {
        let partition = (offset % 3) as i32;
        records.push(record(
            partition,
            offset,
            &format!("p{partition}-{offset}"),
            "2023-08-01T15:04:10Z",
            "INFO",
        ));
    }

    let (acks, _consumer) = run_to_end(h.stores(), records).await;
    let acked = acks.acked();
    assert_eq!(acked.len(), 20);

    for partition in 0..3 {
        let offsets: Vec<i64> = acked
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, o)| *o)
            .collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_eq!(offsets, sorted, "partition {partition} out of order");
    }
}

#[tokio::test]
async fn test_start_fails_when_schema_cannot_be_ensured() {
    let h = Harness::new();
    let stores = Stores::new(Arc::new(FailingIndex), h.recent.clone(), h.errors.clone());
    let consumer = IngestConsumer::new(stores, ConsumerOptions::default());
    let (_tx, source) = ChannelSource::channel(1);

    let err = consumer
        .start(source, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("schema"));
}

#[tokio::test]
async fn test_start_creates_schema() {
    let h = Harness::new();
    let (_acks, _consumer) = run_to_end(h.stores(), Vec::new()).await;
    assert!(h.index.has_schema());
}

#[tokio::test]
async fn test_shutdown_stops_a_live_source() {
    let h = Harness::new();
    let (tx, source) = ChannelSource::channel(16);
    let acks = source.ack_log();
    let shutdown = CancellationToken::new();

    let consumer = IngestConsumer::new(h.stores(), ConsumerOptions::default());
    let token = shutdown.clone();
    let task = tokio::spawn(async move { consumer.run(source, token).await });

    for i in 0..3 {
        tx.send(record(0, i, &format!("e{i}"), "2023-08-01T15:04:10Z", "INFO"))
            .await
            .unwrap();
    }
    wait_for_acks(&acks, 3).await;

    shutdown.cancel();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer did not stop")
        .unwrap();

    assert_eq!(snapshot.stored, 3);
    assert_eq!(h.index.len(), 3);
}

// ============================================================================
// Transport errors
// ============================================================================

struct FlakySource {
    script: VecDeque<Result<Option<StreamRecord>>>,
    acks: Arc<AckLog>,
}

#[async_trait]
impl RecordSource for FlakySource {
    async fn recv(&mut self) -> Result<Option<StreamRecord>> {
        self.script.pop_front().unwrap_or(Ok(None))
    }

    fn acker(&self) -> Arc<dyn Acknowledge> {
        self.acks.clone()
    }
}

#[tokio::test(start_paused = true)]
async fn test_receive_errors_are_retried() {
    let h = Harness::new();
    let acks = Arc::new(AckLog::default());
    let source = FlakySource {
        script: VecDeque::from(vec![
            Err(anyhow::anyhow!("broker transport failure")),
            Err(anyhow::anyhow!("broker transport failure")),
            Ok(Some(record(0, 0, "a1", "2023-08-01T15:04:10Z", "ERROR"))),
        ]),
        acks: acks.clone(),
    };

    let consumer = IngestConsumer::new(h.stores(), ConsumerOptions::default());
    let snapshot = consumer.run(source, CancellationToken::new()).await;

    assert_eq!(snapshot.stored, 1);
    assert_eq!(acks.acked(), vec![(0, 0)]);
}
