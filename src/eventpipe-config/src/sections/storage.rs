use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Object storage target for the Parquet lake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `fs://<root>`, `s3://<bucket>` or `memory://`
    #[serde(default = "default_storage_uri")]
    pub uri: String,

    /// Key prefix in front of the `year=/month=/day=` partitions
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub compression: CompressionCodec,

    #[serde(default)]
    pub s3_region: Option<String>,

    #[serde(default)]
    pub s3_endpoint: Option<String>,

    /// Connectivity probe timeout
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uri: default_storage_uri(),
            prefix: default_prefix(),
            compression: CompressionCodec::default(),
            s3_region: None,
            s3_endpoint: None,
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

fn default_storage_uri() -> String { "fs://./data/lake".to_string() }
fn default_prefix() -> String { "learner-events".to_string() }
fn default_check_timeout_ms() -> u64 { 5_000 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    #[default]
    Zstd,
    Snappy,
    Gzip,
    Lz4,
    None,
}

impl CompressionCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionCodec::Zstd => "zstd",
            CompressionCodec::Snappy => "snappy",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Lz4 => "lz4",
            CompressionCodec::None => "none",
        }
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zstd" => Ok(CompressionCodec::Zstd),
            "snappy" => Ok(CompressionCodec::Snappy),
            "gzip" => Ok(CompressionCodec::Gzip),
            "lz4" => Ok(CompressionCodec::Lz4),
            "none" | "uncompressed" => Ok(CompressionCodec::None),
            other => Err(format!("unknown compression codec: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_parsing() {
        assert_eq!("ZSTD".parse::<CompressionCodec>().unwrap(), CompressionCodec::Zstd);
        assert_eq!("uncompressed".parse::<CompressionCodec>().unwrap(), CompressionCodec::None);
        assert!("brotli".parse::<CompressionCodec>().is_err());
    }
}
