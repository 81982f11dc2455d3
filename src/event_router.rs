//! Per-partition record routing.
//! Each partition gets one worker fed by a bounded channel, so records of a
//! partition are handled strictly in delivery order while partitions run
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::consumer::IngestPipeline;
use crate::stream::{Acknowledge, StreamRecord};

/// Default number of records queued per partition worker.
pub const PARTITION_CAPACITY: usize = 64;

struct PartitionWorker {
    tx: mpsc::Sender<StreamRecord>,
    handle: JoinHandle<()>,
}

pub struct PartitionRouter {
    workers: HashMap<i32, PartitionWorker>,
    pipeline: IngestPipeline,
    acker: Arc<dyn Acknowledge>,
    capacity: usize,
    shutdown: CancellationToken,
}

impl PartitionRouter {
    pub fn new(
        pipeline: IngestPipeline,
        acker: Arc<dyn Acknowledge>,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            workers: HashMap::new(),
            pipeline,
            acker,
            capacity: capacity.max(1),
            shutdown,
        }
    }

    /// Queue a record on its partition's worker, spawning the worker on first use.
    /// Waits while that worker's queue is full.
    pub async fn route(&mut self, record: StreamRecord) -> Result<()> {
        let partition = record.partition;
        let stale = self
            .workers
            .get(&partition)
            .is_some_and(|w| w.tx.is_closed());
        if stale {
            warn!(partition, "partition worker stopped, respawning");
            self.workers.remove(&partition);
        }

        let Self {
            workers,
            pipeline,
            acker,
            capacity,
            shutdown,
        } = self;
        let worker = workers.entry(partition).or_insert_with(|| {
            spawn_worker(
                partition,
                *capacity,
                pipeline.clone(),
                acker.clone(),
                shutdown.clone(),
            )
        });

        worker
            .tx
            .send(record)
            .await
            .map_err(|_| anyhow::anyhow!("partition {partition} worker is gone"))
    }

    pub fn partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.workers.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    /// Close every queue and wait for the workers to finish.
    pub async fn shutdown(self) {
        for (partition, worker) in self.workers {
            drop(worker.tx);
            if let Err(err) = worker.handle.await {
                warn!(partition, "partition worker ended abnormally: {err}");
            }
        }
    }
}

fn spawn_worker(
    partition: i32,
    capacity: usize,
    pipeline: IngestPipeline,
    acker: Arc<dyn Acknowledge>,
    shutdown: CancellationToken,
) -> PartitionWorker {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(run_partition(partition, rx, pipeline, acker, shutdown));
    debug!(partition, "spawned partition worker");
    PartitionWorker { tx, handle }
}

async fn run_partition(
    partition: i32,
    mut rx: mpsc::Receiver<StreamRecord>,
    pipeline: IngestPipeline,
    acker: Arc<dyn Acknowledge>,
    shutdown: CancellationToken,
) {
    loop {
        // Cancellation is only observed between records; the one being handled completes.
        let record = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(record) => record,
                None => break,
            },
        };

        pipeline.handle(&record).await;

        if let Err(err) = acker.ack(&record) {
            warn!(partition, offset = record.offset, "ack failed: {err:#}");
        }
    }
    debug!(partition, "partition worker exiting");
}
