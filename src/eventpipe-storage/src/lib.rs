//! Storage writer: events -> Arrow -> Parquet -> partitioned object storage.

pub mod operator;
pub mod partition;
pub mod columnar;
pub mod writer;

pub use operator::{create_operator, StorageError};
pub use partition::{object_key, partition_date_for};
pub use columnar::{encode_parquet, event_schema, events_to_record_batch};
pub use writer::StorageWriter;
