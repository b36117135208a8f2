pub mod ingestion;
pub mod broker;
pub mod storage;
pub mod runtime;

pub use ingestion::{BufferConfig, GatewayConfig, PublisherConfig, ValidationConfig};
pub use broker::{ConsumerConfig, KafkaConfig};
pub use storage::{CompressionCodec, StorageConfig};
pub use runtime::{LogFormat, LoggingConfig, RuntimeConfig};
