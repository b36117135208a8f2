use eventpipe_config::StorageConfig;
use opendal::{services, Operator};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Unsupported storage URI: {0}")]
    UnsupportedUri(String),

    #[error("Storage backend error: {0}")]
    Backend(#[from] opendal::Error),
}

/// Build an OpenDAL operator from `fs://<root>`, `s3://<bucket>` or `memory://`
pub fn create_operator(config: &StorageConfig) -> Result<Operator, StorageError> {
    let uri = config.uri.as_str();

    let operator = if let Some(root) = uri.strip_prefix("fs://") {
        let root = if root.is_empty() { "./data/lake" } else { root };
        Operator::new(services::Fs::default().root(root))?.finish()
    } else if let Some(bucket) = uri.strip_prefix("s3://") {
        let bucket = bucket.trim_end_matches('/');
        if bucket.is_empty() {
            return Err(StorageError::UnsupportedUri(uri.to_string()));
        }
        let mut builder = services::S3::default().bucket(bucket);

        // explicit config wins over the AWS environment
        if let Some(region) = config
            .s3_region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok())
        {
            builder = builder.region(&region);
        }
        if let Some(endpoint) = config
            .s3_endpoint
            .clone()
            .or_else(|| std::env::var("AWS_ENDPOINT_URL").ok())
        {
            builder = builder.endpoint(&endpoint);
        }
        Operator::new(builder)?.finish()
    } else if uri.starts_with("memory://") {
        Operator::new(services::Memory::default())?.finish()
    } else {
        return Err(StorageError::UnsupportedUri(uri.to_string()));
    };

    info!("[WRITER] Storage operator ready for {}", uri);
    Ok(operator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(uri: &str) -> StorageConfig {
        StorageConfig {
            uri: uri.to_string(),
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_memory_and_fs_operators() {
        assert!(create_operator(&config("memory://")).is_ok());

        let dir = tempfile::tempdir().unwrap();
        let uri = format!("fs://{}", dir.path().display());
        assert!(create_operator(&config(&uri)).is_ok());
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!(matches!(
            create_operator(&config("ftp://lake")),
            Err(StorageError::UnsupportedUri(_))
        ));
        assert!(matches!(
            create_operator(&config("s3://")),
            Err(StorageError::UnsupportedUri(_))
        ));
    }
}
