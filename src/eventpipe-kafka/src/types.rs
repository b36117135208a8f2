use rdkafka::error::KafkaError;
use thiserror::Error;

/// A record pulled from the broker, detached from the client's buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker timestamp in milliseconds, when the broker provided one
    pub timestamp_ms: Option<i64>,
}

/// Position to commit for a partition: the next offset to read
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl PartitionOffset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Kafka client error: {0}")]
    Client(#[from] KafkaError),

    #[error("Failed to deliver to {topic}: {reason}")]
    Send { topic: String, reason: String },

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Topic {0} not found in cluster metadata")]
    UnknownTopic(String),
}
