use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::sink::EventSink;
use crate::source::RecordSource;
use crate::types::{BrokerError, BrokerRecord, PartitionOffset};

/// In-process broker used by tests and local runs.
///
/// Serves as both the producer side and a single consumer group member. It
/// can simulate an outage, failing sends, and a consumer crash that loses
/// every uncommitted position.
pub struct MemoryBroker {
    state: Mutex<State>,
    arrivals: Notify,
}

struct State {
    partitions: i32,
    topics: HashMap<String, Vec<Vec<BrokerRecord>>>,
    subscriptions: Vec<String>,
    positions: BTreeMap<(String, i32), i64>,
    committed: BTreeMap<(String, i32), i64>,
    available: bool,
    failing_sends: usize,
    commit_count: usize,
}

impl State {
    fn topic_mut(&mut self, topic: &str) -> &mut Vec<Vec<BrokerRecord>> {
        let partitions = self.partitions as usize;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }

    fn append(&mut self, topic: &str, partition: i32, key: Option<Vec<u8>>, payload: Option<Vec<u8>>) -> i64 {
        let log = &mut self.topic_mut(topic)[partition as usize];
        let offset = log.len() as i64;
        log.push(BrokerRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            payload,
            timestamp_ms: Some(chrono::Utc::now().timestamp_millis()),
        });
        offset
    }
}

impl MemoryBroker {
    pub fn new(partitions: i32) -> Self {
        Self {
            state: Mutex::new(State {
                partitions: partitions.max(1),
                topics: HashMap::new(),
                subscriptions: Vec::new(),
                positions: BTreeMap::new(),
                committed: BTreeMap::new(),
                available: true,
                failing_sends: 0,
                commit_count: 0,
            }),
            arrivals: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // a poisoned lock only means a test thread panicked mid-update
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Consume `topic` from the group's committed position
    pub fn subscribe(&self, topic: &str) {
        let mut state = self.state();
        state.topic_mut(topic);
        if !state.subscriptions.iter().any(|t| t == topic) {
            state.subscriptions.push(topic.to_string());
        }
    }

    /// Take the broker down or bring it back
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
        if available {
            self.arrivals.notify_one();
        }
    }

    /// Make the next `count` sends fail while the broker otherwise stays up
    pub fn fail_next_sends(&self, count: usize) {
        self.state().failing_sends = count;
    }

    /// Forget every uncommitted read position, as a restarted group member would
    pub fn simulate_restart(&self) {
        let mut state = self.state();
        state.positions = state.committed.clone();
    }

    /// Append a raw record, bypassing the producer path
    pub fn inject(&self, topic: &str, partition: i32, payload: Option<Vec<u8>>) -> i64 {
        let offset = self.state().append(topic, partition, None, payload);
        self.arrivals.notify_one();
        offset
    }

    pub fn partition_for(&self, key: &str) -> i32 {
        let partitions = self.state().partitions;
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % partitions as u64) as i32
    }

    /// Every record in a topic, partition by partition
    pub fn records(&self, topic: &str) -> Vec<BrokerRecord> {
        self.state()
            .topics
            .get(topic)
            .map(|parts| parts.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Payloads of a topic decoded as JSON
    pub fn json_payloads(&self, topic: &str) -> Vec<serde_json::Value> {
        self.records(topic)
            .into_iter()
            .filter_map(|r| r.payload)
            .filter_map(|p| serde_json::from_slice(&p).ok())
            .collect()
    }

    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state().committed.get(&(topic.to_string(), partition)).copied()
    }

    pub fn committed_offsets(&self) -> BTreeMap<(String, i32), i64> {
        self.state().committed.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.state().commit_count
    }

    fn take_records(&self, max_records: usize) -> Result<Vec<BrokerRecord>, BrokerError> {
        let mut state = self.state();
        if !state.available {
            return Err(BrokerError::Unavailable("memory broker is down".to_string()));
        }

        let mut out = Vec::new();
        let subscriptions = state.subscriptions.clone();
        for topic in subscriptions {
            for partition in 0..state.partitions {
                let key = (topic.clone(), partition);
                let start = state
                    .positions
                    .get(&key)
                    .or_else(|| state.committed.get(&key))
                    .copied()
                    .unwrap_or(0);

                let log = match state.topics.get(&topic) {
                    Some(parts) => &parts[partition as usize],
                    None => continue,
                };
                let available: Vec<BrokerRecord> = log
                    .iter()
                    .skip(start as usize)
                    .take(max_records - out.len())
                    .cloned()
                    .collect();
                let taken = available.len() as i64;
                out.extend(available);
                state.positions.insert(key, start + taken);

                if out.len() >= max_records {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl EventSink for MemoryBroker {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let partition = self.partition_for(key);
        {
            let mut state = self.state();
            if !state.available {
                return Err(BrokerError::Unavailable("memory broker is down".to_string()));
            }
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(BrokerError::Send {
                    topic: topic.to_string(),
                    reason: "injected send failure".to_string(),
                });
            }
            state.append(topic, partition, Some(key.as_bytes().to_vec()), Some(payload.to_vec()));
        }
        self.arrivals.notify_one();
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), BrokerError> {
        if self.state().available {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("memory broker is down".to_string()))
        }
    }
}

#[async_trait]
impl RecordSource for MemoryBroker {
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<Vec<BrokerRecord>, BrokerError> {
        let notified = self.arrivals.notified();
        let records = self.take_records(max_records)?;
        if !records.is_empty() {
            return Ok(records);
        }
        // wait for the next arrival or the long-poll bound
        let _ = tokio::time::timeout(timeout, notified).await;
        self.take_records(max_records)
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.available {
            return Err(BrokerError::Commit("memory broker is down".to_string()));
        }
        for po in offsets {
            let entry = state
                .committed
                .entry((po.topic.clone(), po.partition))
                .or_insert(po.offset);
            *entry = (*entry).max(po.offset);
        }
        state.commit_count += 1;
        Ok(())
    }

    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        self.state()
            .positions
            .insert((topic.to_string(), partition), offset);
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), BrokerError> {
        EventSink::check_connectivity(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_then_poll_in_offset_order() {
        let broker = MemoryBroker::new(1);
        broker.subscribe("raw");
        for i in 0..3 {
            broker.send("raw", "L1", format!("{}", i).as_bytes()).await.unwrap();
        }

        let records = broker.poll(10, Duration::from_millis(10)).await.unwrap();
        let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);

        // nothing new until something arrives
        assert!(broker.poll(10, Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_redelivers_uncommitted() {
        let broker = MemoryBroker::new(1);
        broker.subscribe("raw");
        broker.inject("raw", 0, Some(b"a".to_vec()));
        broker.inject("raw", 0, Some(b"b".to_vec()));

        let first = broker.poll(1, Duration::from_millis(10)).await.unwrap();
        broker.commit(&[PartitionOffset::new("raw", 0, first[0].offset + 1)]).await.unwrap();
        let second = broker.poll(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second[0].offset, 1);

        broker.simulate_restart();
        let again = broker.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].offset, 1);
    }

    #[tokio::test]
    async fn test_outage_and_injected_failures() {
        let broker = MemoryBroker::new(2);
        broker.set_available(false);
        assert!(broker.send("raw", "k", b"x").await.is_err());
        assert!(EventSink::check_connectivity(&broker).await.is_err());

        broker.set_available(true);
        broker.fail_next_sends(1);
        assert!(broker.send("raw", "k", b"x").await.is_err());
        assert!(broker.send("raw", "k", b"x").await.is_ok());
        assert_eq!(broker.records("raw").len(), 1);
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let broker = MemoryBroker::new(1);
        broker.commit(&[PartitionOffset::new("raw", 0, 5)]).await.unwrap();
        broker.commit(&[PartitionOffset::new("raw", 0, 3)]).await.unwrap();
        assert_eq!(broker.committed_offset("raw", 0), Some(5));
    }
}
