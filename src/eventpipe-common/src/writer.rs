use crate::event::Event;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Cannot write an empty batch")]
    EmptyBatch,

    #[error("Failed to encode batch: {0}")]
    Encode(String),

    #[error("Failed to upload {key}: {reason}")]
    Upload { key: String, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable sink for validated events.
///
/// A successful return means the events are on durable storage and the
/// caller may commit whatever position produced them.
#[async_trait]
pub trait EventWriter: Send + Sync {
    /// Write one batch and return the object key it landed under.
    /// The same `batch_id` and events always map to the same key.
    async fn write_batch(&self, batch_id: Uuid, events: &[Event]) -> Result<String, WriteError>;

    async fn check_connectivity(&self) -> Result<(), WriteError>;
}
