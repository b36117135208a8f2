use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Front door listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_http_bind")]
    pub http_bind: String,

    #[serde(default = "default_grpc_bind")]
    pub grpc_bind: String,

    /// Upper bound for a single decoded gRPC message
    #[serde(default = "default_grpc_max_message_bytes")]
    pub grpc_max_message_bytes: usize,

    /// Acks buffered per stream before the reader waits on the client
    #[serde(default = "default_stream_ack_buffer")]
    pub stream_ack_buffer: usize,

    #[serde(default = "default_source_tag")]
    pub default_source: String,

    /// Readiness probe timeout for the broker check
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_bind: default_http_bind(),
            grpc_bind: default_grpc_bind(),
            grpc_max_message_bytes: default_grpc_max_message_bytes(),
            stream_ack_buffer: default_stream_ack_buffer(),
            default_source: default_source_tag(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

fn default_http_bind() -> String { "0.0.0.0:8080".to_string() }
fn default_grpc_bind() -> String { "0.0.0.0:50051".to_string() }
fn default_grpc_max_message_bytes() -> usize { 16 * 1024 * 1024 }
fn default_stream_ack_buffer() -> usize { 128 }
fn default_source_tag() -> String { "edge".to_string() }
fn default_readiness_timeout_ms() -> u64 { 2_000 }

/// Event and batch limits enforced by the validator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,

    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,

    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    #[serde(default = "default_max_id_length")]
    pub max_id_length: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_event_bytes: default_max_event_bytes(),
            max_batch_events: default_max_batch_events(),
            max_batch_bytes: default_max_batch_bytes(),
            max_id_length: default_max_id_length(),
        }
    }
}

fn default_max_event_bytes() -> usize { 1024 * 1024 }
fn default_max_batch_events() -> usize { 10_000 }
fn default_max_batch_bytes() -> usize { 10 * 1024 * 1024 }
fn default_max_id_length() -> usize { 255 }

/// Retry policy for broker publishing and the overflow flusher cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl PublisherConfig {
    /// Exponential backoff for the given zero-based attempt, capped at max_backoff_ms
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_base_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 5_000 }
fn default_flush_interval_secs() -> u64 { 5 }

/// Disk-backed overflow buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_directory")]
    pub directory: PathBuf,

    #[serde(default = "default_buffer_max_size_mb")]
    pub max_size_mb: u64,

    #[serde(default = "default_buffer_retention_hours")]
    pub retention_hours: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            directory: default_buffer_directory(),
            max_size_mb: default_buffer_max_size_mb(),
            retention_hours: default_buffer_retention_hours(),
        }
    }
}

impl BufferConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

fn default_buffer_directory() -> PathBuf { PathBuf::from("./data/overflow") }
fn default_buffer_max_size_mb() -> u64 { 1024 }
fn default_buffer_retention_hours() -> u64 { 72 }
