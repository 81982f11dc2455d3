//! Stream boundary: ordered, partitioned, at-least-once delivery of opaque payloads.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One delivered record. Position is owned by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl StreamRecord {
    pub fn new(partition: i32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Marks a record as handled so the transport may advance past it.
pub trait Acknowledge: Send + Sync {
    fn ack(&self, record: &StreamRecord) -> Result<()>;
}

#[async_trait]
pub trait RecordSource: Send {
    /// Next record; `Ok(None)` once the source is exhausted.
    async fn recv(&mut self) -> Result<Option<StreamRecord>>;

    fn acker(&self) -> Arc<dyn Acknowledge>;
}

/// Acknowledged `(partition, offset)` pairs, in ack order.
#[derive(Default)]
pub struct AckLog {
    acked: Mutex<Vec<(i32, i64)>>,
}

impl AckLog {
    pub fn acked(&self) -> Vec<(i32, i64)> {
        self.acked.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.acked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Acknowledge for AckLog {
    fn ack(&self, record: &StreamRecord) -> Result<()> {
        self.acked.lock().push((record.partition, record.offset));
        Ok(())
    }
}

/// In-process source fed through an mpsc channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<StreamRecord>,
    acks: Arc<AckLog>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<StreamRecord>) -> Self {
        Self {
            rx,
            acks: Arc::new(AckLog::default()),
        }
    }

    /// Create a connected sender/source pair.
    pub fn channel(capacity: usize) -> (mpsc::Sender<StreamRecord>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    pub fn ack_log(&self) -> Arc<AckLog> {
        self.acks.clone()
    }
}

#[async_trait]
impl RecordSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<StreamRecord>> {
        Ok(self.rx.recv().await)
    }

    fn acker(&self) -> Arc<dyn Acknowledge> {
        self.acks.clone()
    }
}
