use chrono::Utc;
use eventpipe_common::{describe, DeadLetterRecord, Event, EventBatch, EventValidator};
use eventpipe_config::{KafkaConfig, PublisherConfig};
use eventpipe_metrics::{BUFFER_FLUSHED_EVENTS_TOTAL, PUBLISHER_EVENTS_TOTAL, PUBLISHER_RETRIES_TOTAL};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferError, OverflowBuffer};
use crate::sink::EventSink;
use crate::types::BrokerError;

/// Where the events of one `publish` call ended up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishResult {
    pub published: usize,
    pub buffered: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed_batches: usize,
    pub flushed_events: usize,
    pub expired_events: usize,
    pub remaining_batches: usize,
}

#[derive(Error, Debug)]
pub enum PublishError {
    /// Broker unreachable and the overflow buffer is full
    #[error("Publisher overloaded: {published} events published, {rejected} rejected because the overflow buffer is full")]
    Overloaded {
        published: usize,
        dead_lettered: usize,
        rejected: usize,
    },

    #[error("Overflow buffer failure: {0}")]
    Buffer(#[from] BufferError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Publishes validated events, one broker message per event keyed by learner id.
///
/// Events the broker does not accept after the retry budget go to the
/// overflow buffer; events that fail re-validation go to the dead-letter topic.
pub struct BrokerPublisher {
    sink: Arc<dyn EventSink>,
    buffer: Mutex<OverflowBuffer>,
    validator: EventValidator,
    config: PublisherConfig,
    raw_topic: String,
    dead_letter_topic: String,
    overloaded: AtomicBool,
    buffer_pending: AtomicBool,
}

impl BrokerPublisher {
    pub fn new(
        sink: Arc<dyn EventSink>,
        buffer: OverflowBuffer,
        validator: EventValidator,
        config: PublisherConfig,
        kafka: &KafkaConfig,
    ) -> Self {
        let overloaded = buffer.is_at_capacity();
        let pending = !buffer.is_empty();
        if pending {
            info!(
                "[PUBLISHER] {} batches ({} bytes) waiting in the overflow buffer from a previous run",
                buffer.batch_count(),
                buffer.used_bytes()
            );
        }

        Self {
            sink,
            buffer: Mutex::new(buffer),
            validator,
            config,
            raw_topic: kafka.raw_topic.clone(),
            dead_letter_topic: kafka.dead_letter_topic.clone(),
            overloaded: AtomicBool::new(overloaded),
            buffer_pending: AtomicBool::new(pending),
        }
    }

    /// True while the overflow buffer cannot take more batches
    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Relaxed)
    }

    /// True while batches are waiting in the overflow buffer
    pub fn has_buffered_batches(&self) -> bool {
        self.buffer_pending.load(Ordering::Relaxed)
    }

    pub async fn buffer_usage(&self) -> (usize, u64) {
        let buffer = self.buffer.lock().await;
        (buffer.batch_count(), buffer.used_bytes())
    }

    pub async fn check_connectivity(&self) -> Result<(), BrokerError> {
        self.sink.check_connectivity().await
    }

    pub async fn publish(&self, batch: EventBatch) -> Result<PublishResult, PublishError> {
        let EventBatch {
            batch_id,
            source,
            received_at,
            events,
        } = batch;
        let mut result = PublishResult::default();

        // Re-validate; anything that fails here goes straight to the dead-letter topic
        let mut deliverable: Vec<(Event, Vec<u8>)> = Vec::with_capacity(events.len());
        for event in events {
            match self.validator.validate(&event) {
                Ok(()) => match serde_json::to_vec(&event) {
                    Ok(payload) => deliverable.push((event, payload)),
                    Err(e) => {
                        if self.dead_letter(&event, &e.to_string(), 0, &source).await {
                            result.dead_lettered += 1;
                        }
                    }
                },
                Err(errors) => {
                    if self.dead_letter(&event, &describe(&errors), 0, &source).await {
                        result.dead_lettered += 1;
                    }
                }
            }
        }

        let mut pending: Vec<usize> = (0..deliverable.len()).collect();
        let mut attempt = 0u32;
        loop {
            let sends = pending.iter().map(|&i| {
                let (event, payload) = &deliverable[i];
                self.sink.send(&self.raw_topic, &event.learner_id, payload)
            });
            let outcomes = join_all(sends).await;

            let mut failed = Vec::new();
            let mut last_error = None;
            for (&i, outcome) in pending.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => result.published += 1,
                    Err(e) => {
                        failed.push(i);
                        last_error = Some(e);
                    }
                }
            }
            pending = failed;

            if pending.is_empty() || attempt >= self.config.max_retries {
                if let Some(e) = last_error {
                    warn!(
                        "[PUBLISHER] Batch {}: {} events undelivered after {} attempts, last error: {}",
                        batch_id,
                        pending.len(),
                        attempt + 1,
                        e
                    );
                }
                break;
            }

            let backoff = self.config.backoff_for_attempt(attempt);
            debug!(
                "[PUBLISHER] Batch {}: retrying {} events in {:?}",
                batch_id,
                pending.len(),
                backoff
            );
            PUBLISHER_RETRIES_TOTAL.inc();
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }

        PUBLISHER_EVENTS_TOTAL
            .with_label_values(&["published"])
            .inc_by(result.published as u64);

        if !pending.is_empty() {
            let remaining: Vec<Event> = pending
                .into_iter()
                .map(|i| deliverable[i].0.clone())
                .collect();
            let rejected = remaining.len();
            let overflow = EventBatch {
                batch_id: batch_id.clone(),
                source,
                received_at,
                events: remaining,
            };

            let mut buffer = self.buffer.lock().await;
            match buffer.append(&overflow) {
                Ok(entry) => {
                    result.buffered = rejected;
                    self.buffer_pending.store(true, Ordering::Relaxed);
                    self.overloaded
                        .store(buffer.is_at_capacity(), Ordering::Relaxed);
                    PUBLISHER_EVENTS_TOTAL
                        .with_label_values(&["buffered"])
                        .inc_by(rejected as u64);
                    warn!(
                        "[PUBLISHER] Broker unavailable, buffered {} events of batch {} to {:?}",
                        rejected, batch_id, entry.path
                    );
                }
                Err(BufferError::Full { .. }) => {
                    self.overloaded.store(true, Ordering::Relaxed);
                    PUBLISHER_EVENTS_TOTAL
                        .with_label_values(&["rejected"])
                        .inc_by(rejected as u64);
                    error!(
                        "[PUBLISHER] Overflow buffer full, rejecting {} events of batch {}",
                        rejected, batch_id
                    );
                    return Err(PublishError::Overloaded {
                        published: result.published,
                        dead_lettered: result.dead_lettered,
                        rejected,
                    });
                }
                Err(e) => {
                    error!(
                        "[PUBLISHER] Failed to buffer {} events of batch {}: {}",
                        rejected, batch_id, e
                    );
                    return Err(e.into());
                }
            }
        }

        Ok(result)
    }

    /// Send one dead-letter record. Returns whether the broker took it.
    async fn dead_letter(&self, event: &Event, reason: &str, retry_count: u32, source: &str) -> bool {
        let original_payload =
            serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
        self.dead_letter_raw(&event.learner_id, original_payload, reason, retry_count, source)
            .await
    }

    /// Dead-letter a payload that never became an event (e.g. undecodable JSON)
    pub async fn dead_letter_raw(
        &self,
        key: &str,
        original_payload: String,
        reason: &str,
        retry_count: u32,
        source: &str,
    ) -> bool {
        let record = DeadLetterRecord::new(original_payload, reason, retry_count, source);
        let payload = match serde_json::to_vec(&record) {
            Ok(p) => p,
            Err(e) => {
                error!("[PUBLISHER] Cannot encode dead-letter record: {}", e);
                return false;
            }
        };

        match self.sink.send(&self.dead_letter_topic, key, &payload).await {
            Ok(()) => {
                PUBLISHER_EVENTS_TOTAL
                    .with_label_values(&["dead_lettered"])
                    .inc();
                debug!("[PUBLISHER] Dead-lettered event from {}: {}", source, reason);
                true
            }
            Err(e) => {
                PUBLISHER_EVENTS_TOTAL
                    .with_label_values(&["dead_letter_failed"])
                    .inc();
                error!(
                    original_payload = %record.original_payload,
                    "[PUBLISHER] Dead-letter publish failed ({}), event dropped: {}",
                    reason, e
                );
                false
            }
        }
    }

    /// One flusher round: evict expired batches, then re-publish the rest oldest first.
    ///
    /// A batch file is only deleted once every event in it was acknowledged.
    /// The first failure ends the round.
    pub async fn flush_buffer_once(&self) -> Result<FlushReport, PublishError> {
        let mut buffer = self.buffer.lock().await;
        let mut report = FlushReport {
            expired_events: buffer.evict_expired(Utc::now())?,
            ..FlushReport::default()
        };

        for entry in buffer.list()? {
            let batch = match buffer.read(&entry) {
                Ok(batch) => batch,
                Err(BufferError::Corrupt { .. }) => continue,
                Err(e) => return Err(e.into()),
            };

            let mut payloads = Vec::with_capacity(batch.events.len());
            for event in &batch.events {
                payloads.push((event.learner_id.as_str(), serde_json::to_vec(event).map_err(BufferError::from)?));
            }

            let outcomes = join_all(
                payloads
                    .iter()
                    .map(|(key, payload)| self.sink.send(&self.raw_topic, key, payload)),
            )
            .await;

            if let Some(e) = outcomes.into_iter().find_map(Result::err) {
                // whole batch is re-sent next round; duplicates are acceptable downstream
                warn!(
                    "[PUBLISHER] Buffer flush stopped at batch {}: {}",
                    batch.header.batch_id, e
                );
                break;
            }

            buffer.remove(&entry)?;
            report.flushed_batches += 1;
            report.flushed_events += batch.events.len();
            BUFFER_FLUSHED_EVENTS_TOTAL.inc_by(batch.events.len() as u64);
            PUBLISHER_EVENTS_TOTAL
                .with_label_values(&["flushed"])
                .inc_by(batch.events.len() as u64);
        }

        report.remaining_batches = buffer.batch_count();
        self.overloaded
            .store(buffer.is_at_capacity(), Ordering::Relaxed);
        self.buffer_pending
            .store(!buffer.is_empty(), Ordering::Relaxed);

        if report.flushed_batches > 0 {
            info!(
                "[PUBLISHER] Flushed {} buffered batches ({} events), {} remaining",
                report.flushed_batches, report.flushed_events, report.remaining_batches
            );
        }
        Ok(report)
    }

    /// Spawn the background flusher; it runs until the shutdown channel fires
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        let period = self.config.flush_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("[PUBLISHER] Buffer flusher started (every {:?})", period);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("[PUBLISHER] Buffer flusher stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = publisher.flush_buffer_once().await {
                            error!("[PUBLISHER] Buffer flush failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use eventpipe_common::EventType;
    use eventpipe_config::{BufferConfig, ValidationConfig};
    use tempfile::tempdir;

    fn publisher_with(broker: Arc<MemoryBroker>, dir: &std::path::Path, max_size_mb: u64) -> BrokerPublisher {
        let buffer = OverflowBuffer::open(&BufferConfig {
            directory: dir.to_path_buf(),
            max_size_mb,
            retention_hours: 1,
        })
        .unwrap();
        let config = PublisherConfig {
            max_retries: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
            flush_interval_secs: 1,
        };
        BrokerPublisher::new(
            broker,
            buffer,
            EventValidator::new(&ValidationConfig::default()),
            config,
            &KafkaConfig::default(),
        )
    }

    fn batch(n: usize) -> EventBatch {
        let events = (0..n)
            .map(|i| {
                let mut e = Event::new(format!("L{}", i), EventType::PageView, format!("E{}", i), "2025-03-14T10:00:00Z");
                e.stamp(Utc::now());
                e
            })
            .collect();
        EventBatch::new("batch-1", "test", Utc::now(), events).unwrap()
    }

    #[tokio::test]
    async fn test_publish_one_message_per_event() {
        let broker = Arc::new(MemoryBroker::new(3));
        let dir = tempdir().unwrap();
        let publisher = publisher_with(broker.clone(), dir.path(), 1);

        let result = publisher.publish(batch(5)).await.unwrap();
        assert_eq!(result, PublishResult { published: 5, buffered: 0, dead_lettered: 0 });

        let records = broker.records("learner-events.raw");
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.key.is_some()));
    }

    #[tokio::test]
    async fn test_invalid_event_dead_lettered_not_retried() {
        let broker = Arc::new(MemoryBroker::new(1));
        let dir = tempdir().unwrap();
        let publisher = publisher_with(broker.clone(), dir.path(), 1);

        let mut b = batch(3);
        b.events[1].event_type = "bogus".to_string();
        let result = publisher.publish(b).await.unwrap();

        assert_eq!(result.published, 2);
        assert_eq!(result.dead_lettered, 1);

        let dead = broker.json_payloads("learner-events.dead-letter");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0]["retry_count"], 0);
        assert!(dead[0]["reason"].as_str().unwrap().contains("event_type"));
        assert!(dead[0]["original_payload"].as_str().unwrap().contains("bogus"));
    }

    #[tokio::test]
    async fn test_only_failed_events_are_retried() {
        let broker = Arc::new(MemoryBroker::new(1));
        let dir = tempdir().unwrap();
        let publisher = publisher_with(broker.clone(), dir.path(), 1);

        broker.fail_next_sends(2);
        let result = publisher.publish(batch(4)).await.unwrap();

        assert_eq!(result.published, 4);
        assert_eq!(result.buffered, 0);
        assert_eq!(broker.records("learner-events.raw").len(), 4);
    }

    #[tokio::test]
    async fn test_broker_down_buffers_then_flushes() {
        let broker = Arc::new(MemoryBroker::new(1));
        let dir = tempdir().unwrap();
        let publisher = publisher_with(broker.clone(), dir.path(), 1);

        broker.set_available(false);
        let result = publisher.publish(batch(3)).await.unwrap();
        assert_eq!(result, PublishResult { published: 0, buffered: 3, dead_lettered: 0 });
        assert!(publisher.has_buffered_batches());

        // still down: nothing flushed, nothing lost
        let report = publisher.flush_buffer_once().await.unwrap();
        assert_eq!(report.flushed_events, 0);
        assert_eq!(report.remaining_batches, 1);

        broker.set_available(true);
        let report = publisher.flush_buffer_once().await.unwrap();
        assert_eq!(report.flushed_events, 3);
        assert_eq!(report.remaining_batches, 0);
        assert!(!publisher.has_buffered_batches());
        assert_eq!(broker.records("learner-events.raw").len(), 3);
    }

    #[tokio::test]
    async fn test_full_buffer_reports_overloaded() {
        let broker = Arc::new(MemoryBroker::new(1));
        let dir = tempdir().unwrap();
        let publisher = publisher_with(broker.clone(), dir.path(), 1);
        broker.set_available(false);

        let mut big = batch(1);
        big.events[0]
            .data
            .insert("blob".to_string(), serde_json::json!("x".repeat(900 * 1024)));

        publisher.publish(big.clone()).await.unwrap();
        let err = publisher.publish(big).await.unwrap_err();
        assert!(matches!(err, PublishError::Overloaded { published: 0, dead_lettered: 0, rejected: 1 }));
        assert!(publisher.is_overloaded());

        broker.set_available(true);
        publisher.flush_buffer_once().await.unwrap();
        assert!(!publisher.is_overloaded());
    }
}
