use async_trait::async_trait;
use eventpipe_config::{ConsumerConfig, KafkaConfig};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{BrokerError, BrokerRecord, PartitionOffset};

/// Consumer side of the broker.
///
/// Offsets are never committed implicitly; the caller commits after the
/// records are durable elsewhere.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Wait up to `timeout` for the first record, then collect whatever else
    /// arrives during the linger window, up to `max_records`
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<BrokerRecord>, BrokerError>;

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError>;

    /// Move the read position of one partition back so its records are delivered again
    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError>;

    async fn check_connectivity(&self) -> Result<(), BrokerError>;
}

pub struct KafkaRecordSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
    linger: Duration,
    metadata_timeout: Duration,
}

impl KafkaRecordSource {
    pub fn new(config: &KafkaConfig, consumer_config: &ConsumerConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", config.heartbeat_interval_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
            .set("partition.assignment.strategy", "cooperative-sticky")
            .set("enable.partition.eof", "false")
            .set("fetch.min.bytes", "1024")
            .set("fetch.wait.max.ms", "500")
            .create()?;

        consumer.subscribe(&[config.raw_topic.as_str()])?;

        info!(
            "[CONSUMER] Subscribed to {} as group {} (manual commit)",
            config.raw_topic, config.group_id
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.raw_topic.clone(),
            linger: consumer_config.batch_linger(),
            metadata_timeout: config.metadata_timeout(),
        })
    }

    fn detach(message: &BorrowedMessage<'_>) -> BrokerRecord {
        BrokerRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp_ms: message.timestamp().to_millis(),
        }
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<BrokerRecord>, BrokerError> {
        let mut records = Vec::with_capacity(max_records.min(1024));

        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(records),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(message)) => records.push(Self::detach(&message)),
        }

        let deadline = Instant::now() + self.linger;
        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => records.push(Self::detach(&message)),
                Ok(Err(e)) => {
                    // keep what we have; the error resurfaces on the next poll
                    warn!("[CONSUMER] Receive error while lingering: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        debug!("[CONSUMER] Polled {} records", records.len());
        Ok(records)
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for po in offsets {
            tpl.add_partition_offset(&po.topic, po.partition, Offset::Offset(po.offset))?;
        }

        // a sync commit waits on the group coordinator
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Commit(format!("commit task aborted: {}", e)))?
            .map_err(|e| BrokerError::Commit(e.to_string()))
    }

    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let consumer = Arc::clone(&self.consumer);
        let seek_topic = topic.to_string();
        let timeout = self.metadata_timeout;

        tokio::task::spawn_blocking(move || {
            consumer.seek(&seek_topic, partition, Offset::Offset(offset), timeout)
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("seek task aborted: {}", e)))??;

        info!("[CONSUMER] Rewound {}[{}] to offset {}", topic, partition, offset);
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), BrokerError> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let timeout = self.metadata_timeout;

        tokio::task::spawn_blocking(move || {
            let metadata = consumer.fetch_metadata(Some(&topic), timeout)?;
            let known = metadata
                .topics()
                .iter()
                .any(|t| t.name() == topic && t.error().is_none());
            if known {
                Ok(())
            } else {
                Err(BrokerError::UnknownTopic(topic))
            }
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("metadata probe aborted: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // client creation and subscription never touch the network
    fn unreachable_source() -> KafkaRecordSource {
        let config = KafkaConfig {
            brokers: "127.0.0.1:1".to_string(),
            ..KafkaConfig::default()
        };
        KafkaRecordSource::new(&config, &ConsumerConfig::default()).unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_commit_and_rewind_on_single_threaded_runtime() {
        let source = unreachable_source();
        assert!(source.commit(&[]).await.is_ok());

        // nothing is assigned yet, so librdkafka refuses the seek without a round trip
        let topic = source.topic.clone();
        let err = source.rewind(&topic, 0, 5).await.unwrap_err();
        assert!(matches!(err, BrokerError::Client(_)), "{err:?}");
    }
}
