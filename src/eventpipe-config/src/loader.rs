use crate::pipeline_config::PipelineConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParseError(#[from] serde_yaml::Error),

    #[error("Config validation error: {0}")]
    ValidationError(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidOverride { name: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static env var pattern")
});

impl PipelineConfig {
    /// Load from an optional YAML file, then apply environment overrides and validate.
    ///
    /// A missing file is not an error: defaults plus environment are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                info!("Loading configuration from: {}", path.display());
                let content = fs::read_to_string(path)?;
                Self::from_yaml_no_validation(&content)?
            }
            Some(path) => {
                warn!("Config file not found at: {}, using defaults and environment", path.display());
                Self::default()
            }
            None => {
                info!("No config file given, using defaults and environment");
                Self::default()
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml_content: &str) -> Result<Self> {
        let config = Self::from_yaml_no_validation(yaml_content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML after `${VAR}` expansion without validating
    pub fn from_yaml_no_validation(yaml_content: &str) -> Result<Self> {
        let expanded = expand_env_vars(yaml_content, |name| std::env::var(name).ok());
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Apply `EVENTPIPE_*` overrides using the given lookup (normally the process environment)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("EVENTPIPE_KAFKA_BROKERS") {
            info!("Overriding kafka.brokers from environment");
            self.kafka.brokers = value;
        }
        if let Some(value) = lookup("EVENTPIPE_RAW_TOPIC") {
            self.kafka.raw_topic = value;
        }
        if let Some(value) = lookup("EVENTPIPE_DEAD_LETTER_TOPIC") {
            self.kafka.dead_letter_topic = value;
        }
        if let Some(value) = lookup("EVENTPIPE_GROUP_ID") {
            self.kafka.group_id = value;
        }
        if let Some(value) = lookup("EVENTPIPE_STORAGE_URI") {
            info!("Overriding storage.uri from environment");
            self.storage.uri = value;
        }
        if let Some(value) = lookup("EVENTPIPE_STORAGE_PREFIX") {
            self.storage.prefix = value;
        }
        if let Some(value) = lookup("EVENTPIPE_STORAGE_COMPRESSION") {
            self.storage.compression = value.parse().map_err(|_| ConfigError::InvalidOverride {
                name: "EVENTPIPE_STORAGE_COMPRESSION".to_string(),
                value,
            })?;
        }
        if let Some(value) = lookup("EVENTPIPE_BUFFER_DIR") {
            self.buffer.directory = value.into();
        }
        if let Some(value) = lookup("EVENTPIPE_BUFFER_MAX_SIZE_MB") {
            self.buffer.max_size_mb = value.parse().map_err(|_| ConfigError::InvalidOverride {
                name: "EVENTPIPE_BUFFER_MAX_SIZE_MB".to_string(),
                value,
            })?;
        }
        if let Some(value) = lookup("EVENTPIPE_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [
            ("gateway.http_bind", &self.gateway.http_bind),
            ("gateway.grpc_bind", &self.gateway.grpc_bind),
            ("pipeline.health_bind", &self.pipeline.health_bind),
        ] {
            addr.parse::<SocketAddr>().map_err(|e| {
                ConfigError::ValidationError(format!("{} '{}' is not a socket address: {}", name, addr, e))
            })?;
        }

        if self.kafka.brokers.trim().is_empty() {
            return Err(ConfigError::ValidationError("kafka.brokers must not be empty".to_string()));
        }
        if self.kafka.raw_topic.trim().is_empty() || self.kafka.dead_letter_topic.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "kafka.raw_topic and kafka.dead_letter_topic must be set".to_string(),
            ));
        }
        if self.kafka.raw_topic == self.kafka.dead_letter_topic {
            return Err(ConfigError::ValidationError(
                "kafka.dead_letter_topic must differ from kafka.raw_topic".to_string(),
            ));
        }

        let validation = &self.validation;
        if validation.max_event_bytes == 0 || validation.max_batch_events == 0 || validation.max_id_length == 0 {
            return Err(ConfigError::ValidationError(
                "validation limits must be greater than zero".to_string(),
            ));
        }
        if validation.max_event_bytes > validation.max_batch_bytes {
            return Err(ConfigError::ValidationError(format!(
                "validation.max_event_bytes ({}) exceeds validation.max_batch_bytes ({})",
                validation.max_event_bytes, validation.max_batch_bytes
            )));
        }

        if self.publisher.base_backoff_ms > self.publisher.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "publisher.base_backoff_ms must not exceed publisher.max_backoff_ms".to_string(),
            ));
        }
        if self.publisher.flush_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "publisher.flush_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.buffer.max_size_mb == 0 {
            return Err(ConfigError::ValidationError("buffer.max_size_mb must be at least 1".to_string()));
        }
        if self.buffer.retention_hours == 0 {
            return Err(ConfigError::ValidationError("buffer.retention_hours must be at least 1".to_string()));
        }

        if self.consumer.batch_size == 0 {
            return Err(ConfigError::ValidationError("consumer.batch_size must be at least 1".to_string()));
        }
        if self.consumer.poll_timeout_ms == 0 || self.consumer.poll_timeout_ms > 30_000 {
            return Err(ConfigError::ValidationError(format!(
                "consumer.poll_timeout_ms must be within 1..=30000, got {}",
                self.consumer.poll_timeout_ms
            )));
        }
        if self.consumer.poll_timeout_ms >= self.kafka.max_poll_interval_ms {
            return Err(ConfigError::ValidationError(
                "consumer.poll_timeout_ms must be below kafka.max_poll_interval_ms".to_string(),
            ));
        }

        let uri = self.storage.uri.as_str();
        if !(uri.starts_with("fs://") || uri.starts_with("s3://") || uri.starts_with("memory://")) {
            return Err(ConfigError::ValidationError(format!(
                "storage.uri '{}' must start with fs://, s3:// or memory://",
                uri
            )));
        }

        Ok(())
    }
}

/// Replace `${VAR}` placeholders; unknown variables become empty strings
fn expand_env_vars<F>(content: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match lookup(name) {
                Some(value) => value,
                None => {
                    warn!("Environment variable '{}' not found, using empty string", name);
                    String::new()
                }
            }
        })
        .into_owned()
}
