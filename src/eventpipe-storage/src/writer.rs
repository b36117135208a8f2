use async_trait::async_trait;
use chrono::Utc;
use eventpipe_common::{Event, EventWriter, WriteError};
use eventpipe_config::{CompressionCodec, StorageConfig};
use eventpipe_metrics::{WRITER_BYTES_TOTAL, WRITER_EVENTS_TOTAL, WRITER_FILES_TOTAL, WRITER_LATENCY};
use opendal::Operator;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::columnar::encode_parquet;
use crate::operator::{create_operator, StorageError};
use crate::partition::object_key;

const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";

/// Writes event batches as Parquet objects under date partitions.
///
/// One PUT per batch and no retry loop here; the consumer owns retries.
pub struct StorageWriter {
    operator: Operator,
    prefix: String,
    compression: CompressionCodec,
    check_timeout: Duration,
}

impl StorageWriter {
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        Ok(Self::with_operator(create_operator(config)?, config))
    }

    pub fn with_operator(operator: Operator, config: &StorageConfig) -> Self {
        Self {
            operator,
            prefix: config.prefix.clone(),
            compression: config.compression,
            check_timeout: Duration::from_millis(config.check_timeout_ms),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    /// Write events under a fresh batch id
    pub async fn write(&self, events: &[Event]) -> Result<String, WriteError> {
        self.write_batch(Uuid::new_v4(), events).await
    }

    fn object_metadata(&self, body: &[u8], event_count: usize) -> HashMap<String, String> {
        HashMap::from([
            ("source".to_string(), "event-pipeline".to_string()),
            ("format".to_string(), "parquet".to_string()),
            ("compression".to_string(), self.compression.to_string()),
            ("sha256".to_string(), format!("{:x}", Sha256::digest(body))),
            ("event_count".to_string(), event_count.to_string()),
        ])
    }
}

#[async_trait]
impl EventWriter for StorageWriter {
    async fn write_batch(&self, batch_id: Uuid, events: &[Event]) -> Result<String, WriteError> {
        if events.is_empty() {
            return Err(WriteError::EmptyBatch);
        }

        let started = Instant::now();
        let now = Utc::now();
        let key = object_key(&self.prefix, events, batch_id, now);
        let body = encode_parquet(events, batch_id, self.compression, now)?;
        let size = body.len();
        let metadata = self.object_metadata(&body, events.len());

        let mut write = self
            .operator
            .write_with(&key, body)
            .content_type(PARQUET_CONTENT_TYPE);
        if self.operator.info().full_capability().write_with_user_metadata {
            write = write.user_metadata(metadata);
        } else {
            debug!("[WRITER] Backend has no user metadata support, skipping object metadata for {}", key);
        }
        write.await.map_err(|e| WriteError::Upload {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let elapsed = started.elapsed();
        WRITER_FILES_TOTAL.inc();
        WRITER_BYTES_TOTAL.inc_by(size as u64);
        WRITER_EVENTS_TOTAL.inc_by(events.len() as u64);
        WRITER_LATENCY.observe(elapsed.as_secs_f64());

        info!(
            "[WRITER] Wrote {} events ({} bytes, {}) to {} in {:?}",
            events.len(),
            size,
            self.compression,
            key,
            elapsed
        );
        Ok(key)
    }

    async fn check_connectivity(&self) -> Result<(), WriteError> {
        match tokio::time::timeout(self.check_timeout, self.operator.check()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WriteError::Unavailable(e.to_string())),
            Err(_) => Err(WriteError::Unavailable(format!(
                "storage check timed out after {:?}",
                self.check_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;
    use eventpipe_common::EventType;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use arrow::array::AsArray;

    fn memory_writer() -> StorageWriter {
        StorageWriter::new(&StorageConfig {
            uri: "memory://".to_string(),
            ..StorageConfig::default()
        })
        .unwrap()
    }

    fn stamped(id: &str, ts: &str) -> Event {
        let mut e = Event::new("L1", EventType::AssessmentComplete, id, ts);
        e.stamp(Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 1).unwrap());
        e
    }

    #[tokio::test]
    async fn test_write_lands_under_event_date_partition() {
        let writer = memory_writer();
        let events = vec![stamped("E1", "2025-03-14T10:00:00Z")];

        let key = writer.write(&events).await.unwrap();
        assert!(key.starts_with("learner-events/year=2025/month=03/day=14/events_20250314T100001000Z_"));
        assert!(key.ends_with(".parquet"));

        let body = writer.operator().read(&key).await.unwrap().to_vec();
        let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(body))
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<_> = reader.map(|b| b.unwrap()).collect();
        let ids = batches[0].column_by_name("event_id").unwrap().as_string::<i32>();
        assert_eq!(ids.value(0), "E1");
    }

    #[tokio::test]
    async fn test_same_batch_same_key() {
        let writer = memory_writer();
        let events = vec![stamped("E1", "2025-03-14T10:00:00Z"), stamped("E2", "2025-03-14T11:00:00Z")];
        let id = Uuid::new_v4();

        let first = writer.write_batch(id, &events).await.unwrap();
        let second = writer.write_batch(id, &events).await.unwrap();
        assert_eq!(first, second);

        let listed = writer
            .operator()
            .list_with("learner-events/")
            .recursive(true)
            .await
            .unwrap();
        let files: Vec<_> = listed.iter().filter(|e| e.path().ends_with(".parquet")).collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let writer = memory_writer();
        assert!(matches!(writer.write(&[]).await, Err(WriteError::EmptyBatch)));
    }

    #[tokio::test]
    async fn test_connectivity_check_on_memory_backend() {
        assert!(memory_writer().check_connectivity().await.is_ok());
    }

    #[test]
    fn test_object_metadata_contents() {
        let writer = memory_writer();
        let meta = writer.object_metadata(b"parquet-bytes", 7);
        assert_eq!(meta["source"], "event-pipeline");
        assert_eq!(meta["format"], "parquet");
        assert_eq!(meta["compression"], "zstd");
        assert_eq!(meta["event_count"], "7");
        assert_eq!(meta["sha256"].len(), 64);
    }
}
