use serde::{Deserialize, Serialize};

use crate::sections::{
    BufferConfig, ConsumerConfig, GatewayConfig, KafkaConfig, LoggingConfig, PublisherConfig,
    RuntimeConfig, StorageConfig, ValidationConfig,
};

/// Complete configuration for both the gateway and the consumer process.
///
/// Every section falls back to its defaults, so an empty YAML document is a
/// valid (local development) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: RuntimeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}
