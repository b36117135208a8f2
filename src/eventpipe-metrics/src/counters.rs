use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
};
use std::time::Instant;

/// Global registry holding all metric families
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    REGISTRY
        .register(Box::new(collector.clone()))
        .expect("collector registered once");
    collector
}

// ============================================================================
// Gateway
// ============================================================================

/// Events seen by the gateway, by protocol (http/grpc) and outcome (accepted/rejected)
pub static GATEWAY_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            prometheus::opts!(
                "eventpipe_gateway_events_total",
                "Events received by the gateway by protocol and outcome"
            ),
            &["protocol", "outcome"],
        )
        .expect("valid metric"),
    )
});

/// Gateway requests by protocol and response status class
pub static GATEWAY_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            prometheus::opts!(
                "eventpipe_gateway_requests_total",
                "Gateway requests by protocol and status"
            ),
            &["protocol", "status"],
        )
        .expect("valid metric"),
    )
});

/// Batch request latency by protocol
pub static GATEWAY_REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            HistogramOpts::new(
                "eventpipe_gateway_request_seconds",
                "Latency of batch submissions from receipt to publish result",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["protocol"],
        )
        .expect("valid metric"),
    )
});

/// Open gRPC event streams
pub static GATEWAY_ACTIVE_STREAMS: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new("eventpipe_gateway_active_streams", "Open gRPC event streams")
            .expect("valid metric"),
    )
});

/// Record the outcome of one submission
pub fn record_gateway_events(protocol: &str, accepted: usize, rejected: usize, started: Instant) {
    GATEWAY_EVENTS_TOTAL
        .with_label_values(&[protocol, "accepted"])
        .inc_by(accepted as u64);
    GATEWAY_EVENTS_TOTAL
        .with_label_values(&[protocol, "rejected"])
        .inc_by(rejected as u64);
    GATEWAY_REQUEST_LATENCY
        .with_label_values(&[protocol])
        .observe(started.elapsed().as_secs_f64());
}

// ============================================================================
// Publisher and overflow buffer
// ============================================================================

/// Events handled by the publisher by outcome (published/buffered/dead_lettered/flushed)
pub static PUBLISHER_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            prometheus::opts!(
                "eventpipe_publisher_events_total",
                "Events handled by the broker publisher by outcome"
            ),
            &["outcome"],
        )
        .expect("valid metric"),
    )
});

/// Publish retry rounds
pub static PUBLISHER_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("eventpipe_publisher_retries_total", "Publish retry rounds")
            .expect("valid metric"),
    )
});

/// Bytes currently held by the overflow buffer
pub static BUFFER_BYTES_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new("eventpipe_buffer_bytes", "Bytes held by the overflow buffer")
            .expect("valid metric"),
    )
});

/// Batch files currently held by the overflow buffer
pub static BUFFER_BATCHES_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new("eventpipe_buffer_batches", "Batch files held by the overflow buffer")
            .expect("valid metric"),
    )
});

/// Appends refused because the buffer was full
pub static BUFFER_REJECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new(
            "eventpipe_buffer_rejections_total",
            "Batches refused because the overflow buffer was at capacity",
        )
        .expect("valid metric"),
    )
});

/// Events dropped because their buffered batch outlived retention
pub static BUFFER_EXPIRED_EVENTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new(
            "eventpipe_buffer_expired_events_total",
            "Events removed from the overflow buffer after retention expired",
        )
        .expect("valid metric"),
    )
});

/// Buffer files quarantined after a failed checksum
pub static BUFFER_CORRUPT_FILES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new(
            "eventpipe_buffer_corrupt_files_total",
            "Overflow buffer files quarantined as corrupt",
        )
        .expect("valid metric"),
    )
});

/// Events re-published from the buffer
pub static BUFFER_FLUSHED_EVENTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new(
            "eventpipe_buffer_flushed_events_total",
            "Events re-published from the overflow buffer",
        )
        .expect("valid metric"),
    )
});

// ============================================================================
// Consumer
// ============================================================================

/// Records polled from the broker
pub static CONSUMER_RECORDS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("eventpipe_consumer_records_total", "Records polled from the broker")
            .expect("valid metric"),
    )
});

/// Records dropped as undecodable or invalid
pub static CONSUMER_CORRUPT_RECORDS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new(
            "eventpipe_consumer_corrupt_records_total",
            "Records dropped because they could not be decoded or failed validation",
        )
        .expect("valid metric"),
    )
});

/// Offset commits
pub static CONSUMER_COMMITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("eventpipe_consumer_commits_total", "Offset commits")
            .expect("valid metric"),
    )
});

/// Partition groups whose write failed after all retries
pub static CONSUMER_WRITE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new(
            "eventpipe_consumer_write_failures_total",
            "Partition groups left uncommitted after exhausting write retries",
        )
        .expect("valid metric"),
    )
});

/// Numeric consumer state (0 stopped, 1 starting, 2 polling, 3 committing, 4 stopping)
pub static CONSUMER_STATE_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new("eventpipe_consumer_state", "Current broker consumer state")
            .expect("valid metric"),
    )
});

// ============================================================================
// Storage writer
// ============================================================================

/// Parquet objects written
pub static WRITER_FILES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("eventpipe_writer_files_total", "Parquet objects written")
            .expect("valid metric"),
    )
});

/// Parquet bytes uploaded
pub static WRITER_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("eventpipe_writer_bytes_total", "Parquet bytes uploaded")
            .expect("valid metric"),
    )
});

/// Events written to storage
pub static WRITER_EVENTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register(
        IntCounter::new("eventpipe_writer_events_total", "Events written to storage")
            .expect("valid metric"),
    )
});

/// Encode plus upload latency
pub static WRITER_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register(
        Histogram::with_opts(
            HistogramOpts::new(
                "eventpipe_writer_seconds",
                "Time to encode and upload one Parquet object",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .expect("valid metric"),
    )
});
