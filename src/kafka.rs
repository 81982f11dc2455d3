//! Kafka record source.
//! Offsets are stored only after a record's side effects have run, so an
//! unacknowledged record is redelivered after a restart.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use tracing::info;

use crate::stream::{Acknowledge, RecordSource, StreamRecord};

#[derive(Clone, Debug)]
pub struct KafkaConfig {
    pub brokers: Arc<str>,
    pub topic: Arc<str>,
    pub group_id: Arc<str>,
    pub connect_timeout: Duration,
}

pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: Arc<str>,
}

impl KafkaSource {
    /// Create the consumer, verify the brokers answer for the topic, and subscribe.
    pub async fn connect(cfg: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = client_config(cfg)
            .create()
            .context("creating kafka consumer")?;
        let consumer = Arc::new(consumer);

        let meta_client = consumer.clone();
        let topic = cfg.topic.clone();
        let timeout = cfg.connect_timeout;
        let partitions = tokio::task::spawn_blocking(move || {
            meta_client
                .fetch_metadata(Some(&*topic), timeout)
                .map(|md| {
                    md.topics()
                        .iter()
                        .map(|t| t.partitions().len())
                        .sum::<usize>()
                })
        })
        .await
        .context("kafka metadata fetch task")?
        .with_context(|| format!("reaching kafka brokers {}", cfg.brokers))?;

        consumer
            .subscribe(&[&*cfg.topic])
            .with_context(|| format!("subscribing to {}", cfg.topic))?;
        info!(
            brokers = %cfg.brokers,
            topic = %cfg.topic,
            group = %cfg.group_id,
            partitions,
            "kafka consumer connected"
        );

        Ok(Self {
            consumer,
            topic: cfg.topic.clone(),
        })
    }
}

/// Consumer settings: group membership, start at the latest offset, manual offset store.
pub fn client_config(cfg: &KafkaConfig) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &*cfg.brokers)
        .set("group.id", &*cfg.group_id)
        .set("auto.offset.reset", "latest")
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set(
            "socket.connection.setup.timeout.ms",
            cfg.connect_timeout.as_millis().to_string(),
        );
    config
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn recv(&mut self) -> Result<Option<StreamRecord>> {
        let msg = self.consumer.recv().await.context("kafka receive")?;
        Ok(Some(StreamRecord {
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }

    fn acker(&self) -> Arc<dyn Acknowledge> {
        Arc::new(KafkaAck {
            consumer: self.consumer.clone(),
            topic: self.topic.clone(),
        })
    }
}

struct KafkaAck {
    consumer: Arc<StreamConsumer>,
    topic: Arc<str>,
}

impl Acknowledge for KafkaAck {
    fn ack(&self, record: &StreamRecord) -> Result<()> {
        // Stored value is the next offset to consume.
        self.consumer
            .store_offset(&self.topic, record.partition, record.offset + 1)
            .with_context(|| {
                format!(
                    "storing offset {} for {}/{}",
                    record.offset, self.topic, record.partition
                )
            })
    }
}
