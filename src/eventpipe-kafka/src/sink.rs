use async_trait::async_trait;
use eventpipe_config::KafkaConfig;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::BrokerError;

/// Producer side of the broker
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Send one message and wait for the broker acknowledgement
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Confirm the broker is reachable and knows the topic
    async fn check_connectivity(&self) -> Result<(), BrokerError>;
}

pub struct KafkaEventSink {
    producer: FutureProducer,
    probe_topic: String,
    delivery_timeout: Duration,
    metadata_timeout: Duration,
}

impl KafkaEventSink {
    pub fn new(config: &KafkaConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("queue.buffering.max.messages", "100000")
            .set("queue.buffering.max.kbytes", "1048576")
            .set("linger.ms", "10")
            .set("compression.type", &config.producer_compression)
            .create()?;

        info!(
            "[PUBLISHER] Kafka producer created for {} (topic {})",
            config.brokers, config.raw_topic
        );

        Ok(Self {
            producer,
            probe_topic: config.raw_topic.clone(),
            delivery_timeout: config.message_timeout(),
            metadata_timeout: config.metadata_timeout(),
        })
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
        {
            Ok((partition, offset)) => {
                debug!("[PUBLISHER] Delivered to {}[{}]@{}", topic, partition, offset);
                Ok(())
            }
            Err((e, _)) => Err(BrokerError::Send {
                topic: topic.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn check_connectivity(&self) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        let topic = self.probe_topic.clone();
        let timeout = self.metadata_timeout;

        // fetch_metadata blocks the calling thread
        tokio::task::spawn_blocking(move || {
            let metadata = producer.client().fetch_metadata(Some(&topic), timeout)?;
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
