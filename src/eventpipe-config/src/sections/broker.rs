use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kafka connection settings shared by the producer and the consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: String,

    #[serde(default = "default_raw_topic")]
    pub raw_topic: String,

    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter_topic: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// Producer-side compression.type
    #[serde(default = "default_producer_compression")]
    pub producer_compression: String,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            raw_topic: default_raw_topic(),
            dead_letter_topic: default_dead_letter_topic(),
            group_id: default_group_id(),
            client_id: default_client_id(),
            message_timeout_ms: default_message_timeout_ms(),
            producer_compression: default_producer_compression(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            auto_offset_reset: default_auto_offset_reset(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
        }
    }
}

impl KafkaConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }
}

fn default_brokers() -> String { "localhost:9092".to_string() }
fn default_raw_topic() -> String { "learner-events.raw".to_string() }
fn default_dead_letter_topic() -> String { "learner-events.dead-letter".to_string() }
fn default_group_id() -> String { "learner-events-lake-writer".to_string() }
fn default_client_id() -> String { "event-pipeline".to_string() }
fn default_message_timeout_ms() -> u64 { 5_000 }
fn default_producer_compression() -> String { "lz4".to_string() }
fn default_session_timeout_ms() -> u64 { 30_000 }
fn default_heartbeat_interval_ms() -> u64 { 3_000 }
fn default_max_poll_interval_ms() -> u64 { 300_000 }
fn default_auto_offset_reset() -> String { "earliest".to_string() }
fn default_metadata_timeout_ms() -> u64 { 5_000 }

/// Poll loop and write retry settings for the lake consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Long-poll bound while waiting for the first record
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Extra wait for more records once the first one arrived
    #[serde(default = "default_batch_linger_ms")]
    pub batch_linger_ms: u64,

    #[serde(default = "default_write_max_retries")]
    pub write_max_retries: u32,

    #[serde(default = "default_write_backoff_ms")]
    pub write_backoff_ms: u64,

    /// Pause after a failed write before polling again
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            batch_linger_ms: default_batch_linger_ms(),
            write_max_retries: default_write_max_retries(),
            write_backoff_ms: default_write_backoff_ms(),
            failure_backoff_ms: default_failure_backoff_ms(),
        }
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn batch_linger(&self) -> Duration {
        Duration::from_millis(self.batch_linger_ms)
    }

    pub fn write_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.write_backoff_ms.saturating_mul(factor).min(30_000))
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }
}

fn default_batch_size() -> usize { 1_000 }
fn default_poll_timeout_ms() -> u64 { 30_000 }
fn default_batch_linger_ms() -> u64 { 100 }
fn default_write_max_retries() -> u32 { 3 }
fn default_write_backoff_ms() -> u64 { 500 }
fn default_failure_backoff_ms() -> u64 { 1_000 }
