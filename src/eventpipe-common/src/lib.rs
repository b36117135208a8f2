pub mod event;
pub mod validation;
pub mod writer;

pub use event::{
    parse_event_timestamp, BatchConstructionError, DeadLetterRecord, Event, EventBatch, EventType,
    DEFAULT_EVENT_VERSION,
};
pub use validation::{describe, BatchError, EventValidator, FieldError};
pub use writer::{EventWriter, WriteError};
