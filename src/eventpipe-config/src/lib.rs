// Event pipeline configuration
//
// All runtime settings live in one immutable PipelineConfig that is loaded
// once at startup and handed to every component constructor.

pub mod sections;
pub mod pipeline_config;
pub mod loader;

pub use pipeline_config::PipelineConfig;
pub use loader::{ConfigError, Result};
pub use sections::{
    BufferConfig, CompressionCodec, ConsumerConfig, GatewayConfig, KafkaConfig, LogFormat,
    LoggingConfig, PublisherConfig, RuntimeConfig, StorageConfig, ValidationConfig,
};
