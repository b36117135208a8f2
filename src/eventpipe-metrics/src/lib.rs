//! Prometheus instrumentation for the event pipeline binaries.
//!
//! Re-exports the collectors defined in [`counters`], the Axum router for the
//! `/metrics` endpoint provided by [`exporter`] and the health model used by
//! the readiness probes.

#![deny(missing_docs)]

mod counters;
pub mod exporter;
/// Component health aggregation for liveness and readiness probes
pub mod health;

pub use counters::{
    record_gateway_events, BUFFER_BATCHES_GAUGE, BUFFER_BYTES_GAUGE, BUFFER_CORRUPT_FILES_TOTAL,
    BUFFER_EXPIRED_EVENTS_TOTAL, BUFFER_FLUSHED_EVENTS_TOTAL, BUFFER_REJECTIONS_TOTAL,
    CONSUMER_COMMITS_TOTAL, CONSUMER_CORRUPT_RECORDS_TOTAL, CONSUMER_RECORDS_TOTAL,
    CONSUMER_STATE_GAUGE, CONSUMER_WRITE_FAILURES_TOTAL, GATEWAY_ACTIVE_STREAMS,
    GATEWAY_EVENTS_TOTAL, GATEWAY_REQUESTS_TOTAL, GATEWAY_REQUEST_LATENCY, PUBLISHER_EVENTS_TOTAL,
    PUBLISHER_RETRIES_TOTAL, REGISTRY, WRITER_BYTES_TOTAL, WRITER_EVENTS_TOTAL,
    WRITER_FILES_TOTAL, WRITER_LATENCY,
};

pub use health::{ComponentHealth, HealthReport, HealthStatus};
