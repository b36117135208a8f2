pub mod types;
pub mod sink;
pub mod source;
pub mod memory;
pub mod buffer;
pub mod publisher;
pub mod consumer;

pub use types::{BrokerError, BrokerRecord, PartitionOffset};
pub use sink::{EventSink, KafkaEventSink};
pub use source::{KafkaRecordSource, RecordSource};
pub use memory::MemoryBroker;
pub use buffer::{BufferEntry, BufferError, BufferHeader, BufferedBatch, OverflowBuffer};
pub use publisher::{BrokerPublisher, FlushReport, PublishError, PublishResult};
pub use consumer::{group_batch_id, BrokerConsumer, ConsumerState, ConsumerStats, ProcessOutcome};
