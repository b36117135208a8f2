use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle settings for the consumer process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_health_bind")]
    pub health_bind: String,

    #[serde(default = "default_startup_check_timeout_secs")]
    pub startup_check_timeout_secs: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            health_bind: default_health_bind(),
            startup_check_timeout_secs: default_startup_check_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn startup_check_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_check_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

fn default_health_bind() -> String { "0.0.0.0:9090".to_string() }
fn default_startup_check_timeout_secs() -> u64 { 10 }
fn default_shutdown_timeout_secs() -> u64 { 30 }
fn default_readiness_timeout_ms() -> u64 { 2_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_level() -> String { "info".to_string() }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
