use eventpipe_common::{describe, Event, EventValidator, EventWriter};
use eventpipe_config::ConsumerConfig;
use eventpipe_metrics::{
    CONSUMER_COMMITS_TOTAL, CONSUMER_CORRUPT_RECORDS_TOTAL, CONSUMER_RECORDS_TOTAL,
    CONSUMER_STATE_GAUGE, CONSUMER_WRITE_FAILURES_TOTAL,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::source::RecordSource;
use crate::types::{BrokerRecord, PartitionOffset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Stopped = 0,
    Starting = 1,
    Polling = 2,
    Committing = 3,
    Stopping = 4,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerState::Starting,
            2 => ConsumerState::Polling,
            3 => ConsumerState::Committing,
            4 => ConsumerState::Stopping,
            _ => ConsumerState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Stopped => "stopped",
            ConsumerState::Starting => "starting",
            ConsumerState::Polling => "polling",
            ConsumerState::Committing => "committing",
            ConsumerState::Stopping => "stopping",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ConsumerState::Polling | ConsumerState::Committing)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub records: u64,
    pub written_events: u64,
    pub corrupt_records: u64,
    pub commits: u64,
    pub write_failures: u64,
}

/// Result of processing one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub written_events: usize,
    pub corrupt_records: usize,
    pub committed_groups: usize,
    pub failed_groups: usize,
    pub object_keys: Vec<String>,
}

#[derive(Default)]
struct Counters {
    records: AtomicU64,
    written_events: AtomicU64,
    corrupt_records: AtomicU64,
    commits: AtomicU64,
    write_failures: AtomicU64,
}

enum GroupOutcome {
    Written { key: String, events: usize },
    AllCorrupt,
    Failed,
}

/// Consumer group member that moves broker records into durable storage.
///
/// Offsets for a partition are committed only after the storage writer
/// returned success for every record up to that offset.
pub struct BrokerConsumer {
    source: Arc<dyn RecordSource>,
    writer: Arc<dyn EventWriter>,
    validator: EventValidator,
    config: ConsumerConfig,
    state: AtomicU8,
    committed: Mutex<HashMap<(String, i32), i64>>,
    counters: Counters,
}

impl BrokerConsumer {
    pub fn new(
        source: Arc<dyn RecordSource>,
        writer: Arc<dyn EventWriter>,
        validator: EventValidator,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            writer,
            validator,
            config,
            state: AtomicU8::new(ConsumerState::Stopped as u8),
            committed: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        CONSUMER_STATE_GAUGE.set(state as i64);
        if previous != state as u8 {
            debug!("[CONSUMER] State {} -> {}", ConsumerState::from_u8(previous), state);
        }
    }

    /// Offsets committed by this process, per topic-partition (next offset to read)
    pub fn committed_offsets(&self) -> HashMap<(String, i32), i64> {
        self.committed
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            records: self.counters.records.load(Ordering::Relaxed),
            written_events: self.counters.written_events.load(Ordering::Relaxed),
            corrupt_records: self.counters.corrupt_records.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }

    pub async fn check_connectivity(&self) -> Result<(), crate::types::BrokerError> {
        self.source.check_connectivity().await
    }

    /// Poll loop. Returns after the shutdown channel fires and the in-flight
    /// write and commit have finished.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        self.set_state(ConsumerState::Starting);
        info!(
            "[CONSUMER] Starting poll loop (batch_size={}, poll_timeout={:?})",
            self.config.batch_size,
            self.config.poll_timeout()
        );
        self.set_state(ConsumerState::Polling);

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                polled = self.source.poll(self.config.batch_size, self.config.poll_timeout()) => polled,
            };

            let backoff = match polled {
                Ok(records) if records.is_empty() => continue,
                Ok(records) => {
                    let outcome = self.process_records(records).await;
                    outcome.failed_groups > 0
                }
                Err(e) => {
                    error!("[CONSUMER] Poll failed: {}", e);
                    true
                }
            };

            if backoff {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(self.config.failure_backoff()) => {}
                }
            }
        }

        self.set_state(ConsumerState::Stopping);
        let stats = self.stats();
        info!(
            "[CONSUMER] Poll loop stopped: {} records, {} events written, {} corrupt, {} commits, {} write failures",
            stats.records, stats.written_events, stats.corrupt_records, stats.commits, stats.write_failures
        );
        self.set_state(ConsumerState::Stopped);
    }

    /// Group records by partition and move each group to storage
    pub async fn process_records(&self, records: Vec<BrokerRecord>) -> ProcessOutcome {
        self.counters
            .records
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        CONSUMER_RECORDS_TOTAL.inc_by(records.len() as u64);

        let mut groups: BTreeMap<(String, i32), Vec<BrokerRecord>> = BTreeMap::new();
        for record in records {
            groups
                .entry((record.topic.clone(), record.partition))
                .or_default()
                .push(record);
        }

        let mut outcome = ProcessOutcome::default();
        for ((topic, partition), mut group) in groups {
            group.sort_by_key(|r| r.offset);
            let corrupt_before = outcome.corrupt_records;
            match self
                .process_group(&topic, partition, &group, &mut outcome.corrupt_records)
                .await
            {
                GroupOutcome::Written { key, events } => {
                    outcome.written_events += events;
                    outcome.object_keys.push(key);
                    if self.commit_group(&topic, partition, &group).await {
                        outcome.committed_groups += 1;
                    }
                }
                GroupOutcome::AllCorrupt => {
                    warn!(
                        "[CONSUMER] {}[{}]: all {} records corrupt, committing past them",
                        topic,
                        partition,
                        outcome.corrupt_records - corrupt_before
                    );
                    if self.commit_group(&topic, partition, &group).await {
                        outcome.committed_groups += 1;
                    }
                }
                GroupOutcome::Failed => outcome.failed_groups += 1,
            }
        }
        outcome
    }

    async fn process_group(
        &self,
        topic: &str,
        partition: i32,
        records: &[BrokerRecord],
        corrupt: &mut usize,
    ) -> GroupOutcome {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return GroupOutcome::AllCorrupt;
        };
        let (first_offset, last_offset) = (first.offset, last.offset);

        let mut events = Vec::with_capacity(records.len());
        for record in records {
            match self.decode(record) {
                Ok(event) => events.push(event),
                Err(reason) => {
                    *corrupt += 1;
                    self.counters.corrupt_records.fetch_add(1, Ordering::Relaxed);
                    CONSUMER_CORRUPT_RECORDS_TOTAL.inc();
                    warn!(
                        "[CONSUMER] Dropping corrupt record {}[{}]@{}: {}",
                        topic, partition, record.offset, reason
                    );
                }
            }
        }

        if events.is_empty() {
            return GroupOutcome::AllCorrupt;
        }

        let batch_id = group_batch_id(topic, partition, first_offset, last_offset);
        let started = Instant::now();
        let max_retries = self.config.write_max_retries;

        for attempt in 0..=max_retries {
            match self.writer.write_batch(batch_id, &events).await {
                Ok(key) => {
                    self.counters
                        .written_events
                        .fetch_add(events.len() as u64, Ordering::Relaxed);
                    info!(
                        "[CONSUMER] Wrote {} events from {}[{}] offsets {}..={} to {} in {:?}",
                        events.len(),
                        topic,
                        partition,
                        first_offset,
                        last_offset,
                        key,
                        started.elapsed()
                    );
                    return GroupOutcome::Written {
                        key,
                        events: events.len(),
                    };
                }
                Err(e) if attempt < max_retries => {
                    let backoff = self.config.write_backoff(attempt);
                    warn!(
                        "[CONSUMER] Write of {}[{}] offsets {}..={} failed (attempt {}/{}), retrying in {:?}: {}",
                        topic, partition, first_offset, last_offset, attempt + 1, max_retries + 1, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        "[CONSUMER] Write of {}[{}] offsets {}..={} failed after {} attempts, NOT committing: {}",
                        topic, partition, first_offset, last_offset, max_retries + 1, e
                    );
                }
            }
        }

        self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
        CONSUMER_WRITE_FAILURES_TOTAL.inc();

        // Redeliver from the first record of this group on a later poll
        if let Err(e) = self.source.rewind(topic, partition, first_offset).await {
            error!(
                "[CONSUMER] Failed to rewind {}[{}] to {}: {}",
                topic, partition, first_offset, e
            );
        }
        GroupOutcome::Failed
    }

    fn decode(&self, record: &BrokerRecord) -> Result<Event, String> {
        let payload = record.payload.as_deref().ok_or("empty payload")?;
        let event: Event =
            serde_json::from_slice(payload).map_err(|e| format!("undecodable payload: {}", e))?;
        self.validator
            .validate(&event)
            .map_err(|errors| format!("invalid event: {}", describe(&errors)))?;
        Ok(event)
    }

    async fn commit_group(&self, topic: &str, partition: i32, records: &[BrokerRecord]) -> bool {
        let Some(last) = records.last() else {
            return false;
        };
        let next = last.offset + 1;

        self.set_state(ConsumerState::Committing);
        let result = self
            .source
            .commit(&[PartitionOffset::new(topic, partition, next)])
            .await;
        self.set_state(ConsumerState::Polling);

        match result {
            Ok(()) => {
                if let Ok(mut committed) = self.committed.lock() {
                    let entry = committed
                        .entry((topic.to_string(), partition))
                        .or_insert(next);
                    *entry = (*entry).max(next);
                }
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
                CONSUMER_COMMITS_TOTAL.inc();
                debug!("[CONSUMER] Committed {}[{}] at {}", topic, partition, next);
                true
            }
            Err(e) => {
                // the data is durable; a later commit or a redelivery covers it
                error!(
                    "[CONSUMER] Commit of {}[{}] at {} failed: {}",
                    topic, partition, next, e
                );
                false
            }
        }
    }
}

/// Deterministic batch id for a partition group so a redelivered group
/// lands under the same object key
pub fn group_batch_id(topic: &str, partition: i32, first_offset: i64, last_offset: i64) -> Uuid {
    let name = format!("{}:{}:{}-{}", topic, partition, first_offset, last_offset);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use async_trait::async_trait;
    use eventpipe_common::{EventType, WriteError};
    use eventpipe_config::ValidationConfig;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    const TOPIC: &str = "learner-events.raw";

    /// Writer that records batches in memory and can be told to fail
    #[derive(Default)]
    struct RecordingWriter {
        fail: AtomicBool,
        batches: Mutex<Vec<(Uuid, Vec<Event>)>>,
    }

    #[async_trait]
    impl EventWriter for RecordingWriter {
        async fn write_batch(&self, batch_id: Uuid, events: &[Event]) -> Result<String, WriteError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WriteError::Unavailable("storage down".to_string()));
            }
            self.batches.lock().unwrap().push((batch_id, events.to_vec()));
            Ok(format!("events_{}.parquet", batch_id))
        }

        async fn check_connectivity(&self) -> Result<(), WriteError> {
            Ok(())
        }
    }

    fn consumer(broker: Arc<MemoryBroker>, writer: Arc<RecordingWriter>) -> BrokerConsumer {
        let config = ConsumerConfig {
            batch_size: 100,
            poll_timeout_ms: 20,
            batch_linger_ms: 0,
            write_max_retries: 1,
            write_backoff_ms: 1,
            failure_backoff_ms: 1,
        };
        BrokerConsumer::new(
            broker,
            writer,
            EventValidator::new(&ValidationConfig::default()),
            config,
        )
    }

    fn event_payload(id: &str) -> Vec<u8> {
        serde_json::to_vec(&Event::new("L1", EventType::LessonStart, id, "2025-01-05T08:00:00Z")).unwrap()
    }

    async fn poll(broker: &MemoryBroker) -> Vec<BrokerRecord> {
        broker.poll(100, Duration::from_millis(20)).await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_after_write() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker.subscribe(TOPIC);
        for id in ["E1", "E2", "E3"] {
            broker.inject(TOPIC, 0, Some(event_payload(id)));
        }
        let writer = Arc::new(RecordingWriter::default());
        let consumer = consumer(broker.clone(), writer.clone());

        let outcome = consumer.process_records(poll(&broker).await).await;
        assert_eq!(outcome.written_events, 3);
        assert_eq!(outcome.committed_groups, 1);
        assert_eq!(broker.committed_offset(TOPIC, 0), Some(3));
        assert_eq!(consumer.committed_offsets().get(&(TOPIC.to_string(), 0)), Some(&3));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_commit_and_rewinds() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker.subscribe(TOPIC);
        broker.inject(TOPIC, 0, Some(event_payload("E1")));
        let writer = Arc::new(RecordingWriter::default());
        writer.fail.store(true, Ordering::SeqCst);
        let consumer = consumer(broker.clone(), writer.clone());

        let outcome = consumer.process_records(poll(&broker).await).await;
        assert_eq!(outcome.failed_groups, 1);
        assert_eq!(broker.committed_offset(TOPIC, 0), None);
        assert_eq!(consumer.stats().write_failures, 1);

        // the same record comes back and lands under the same batch id
        writer.fail.store(false, Ordering::SeqCst);
        let redelivered = poll(&broker).await;
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].offset, 0);

        consumer.process_records(redelivered).await;
        assert_eq!(broker.committed_offset(TOPIC, 0), Some(1));
        let batches = writer.batches.lock().unwrap();
        assert_eq!(batches[0].0, group_batch_id(TOPIC, 0, 0, 0));
    }

    #[tokio::test]
    async fn test_corrupt_records_dropped_and_all_corrupt_group_committed() {
        let broker = Arc::new(MemoryBroker::new(2));
        broker.subscribe(TOPIC);
        broker.inject(TOPIC, 0, Some(b"{not json".to_vec()));
        broker.inject(TOPIC, 0, None);
        broker.inject(TOPIC, 1, Some(event_payload("E1")));
        broker.inject(TOPIC, 1, Some(br#"{"event_type":"bogus"}"#.to_vec()));

        let writer = Arc::new(RecordingWriter::default());
        let consumer = consumer(broker.clone(), writer.clone());

        let outcome = consumer.process_records(poll(&broker).await).await;
        assert_eq!(outcome.corrupt_records, 3);
        assert_eq!(outcome.written_events, 1);
        assert_eq!(outcome.committed_groups, 2);
        assert_eq!(broker.committed_offset(TOPIC, 0), Some(2));
        assert_eq!(broker.committed_offset(TOPIC, 1), Some(2));

        let batches = writer.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1[0].event_id, "E1");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let broker = Arc::new(MemoryBroker::new(1));
        broker.subscribe(TOPIC);
        let writer = Arc::new(RecordingWriter::default());
        let consumer = Arc::new(consumer(broker.clone(), writer.clone()));

        let (tx, rx) = broadcast::channel(1);
        let handle = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer.run(rx).await })
        };

        broker.inject(TOPIC, 0, Some(event_payload("E1")));
        for _ in 0..100 {
            if broker.committed_offset(TOPIC, 0) == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.committed_offset(TOPIC, 0), Some(1));
        assert!(consumer.state().is_running());

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[test]
    fn test_group_batch_id_is_deterministic() {
        assert_eq!(group_batch_id(TOPIC, 3, 10, 20), group_batch_id(TOPIC, 3, 10, 20));
        assert_ne!(group_batch_id(TOPIC, 3, 10, 20), group_batch_id(TOPIC, 3, 10, 21));
    }
}
