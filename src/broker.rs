use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::errors::{AppError, AppResult};

pub mod topics {
    pub const RAW_EVENTS: &str = "raw-events";
    pub const RAW_EVENTS_BY_ADDRESS: &str = "raw-events-by-address";
    pub const RESOLUTION_REQUESTS: &str = "resolution-requests";
    pub const RESOLUTION_RESPONSES: &str = "resolution-responses";
    pub const LOOKUP_SOURCE: &str = "lookup-source";
    pub const PENDING_SOURCE: &str = "pending-source";
    pub const ENRICHED_OUTPUT: &str = "enriched-output";
    pub const RESOLUTION_DEAD_LETTER: &str = "resolution-dead-letter";

    /// Topics whose log is compacted down to the latest value per key.
    pub const COMPACTED: &[&str] = &[LOOKUP_SOURCE, PENDING_SOURCE];

    pub const ALL: &[&str] = &[
        RAW_EVENTS,
        RAW_EVENTS_BY_ADDRESS,
        RESOLUTION_REQUESTS,
        RESOLUTION_RESPONSES,
        LOOKUP_SOURCE,
        PENDING_SOURCE,
        ENRICHED_OUTPUT,
        RESOLUTION_DEAD_LETTER,
    ];
}

const DEFAULT_LINGER_RECORDS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

/// Producer side of the broker contract. A `None` payload is a tombstone.
#[async_trait]
pub trait RecordProducer: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: Option<Vec<u8>>) -> AppResult<()>;
    async fn flush(&self) -> AppResult<()>;
    async fn close(&self) -> AppResult<()>;
}

/// Consumer side of the broker contract. Positions advance on poll and
/// become durable on commit.
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    fn assign(&mut self, topic: &str, partitions: &[u32]) -> AppResult<()>;
    async fn poll(&mut self, max_records: usize, wait: Duration) -> AppResult<Vec<ConsumerRecord>>;
    fn seek(&mut self, topic: &str, partition: u32, offset: u64) -> AppResult<()>;
    fn position(&self, topic: &str, partition: u32) -> Option<u64>;
    /// Moves every assigned partition back to its last committed offset,
    /// discarding uncommitted progress.
    fn rewind(&mut self) -> AppResult<()>;
    async fn commit(&mut self) -> AppResult<()>;
}

/// Stable key partitioner shared by every topic so keyed state stays co-partitioned.
pub fn partition_for(key: &str, partition_count: u32) -> u32 {
    let count = partition_count.max(1);
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(count)) as u32
}

#[derive(Debug, Clone)]
struct StoredRecord {
    offset: u64,
    key: String,
    payload: Option<Vec<u8>>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<StoredRecord>,
    next_offset: u64,
}

impl PartitionLog {
    fn append(&mut self, key: String, payload: Option<Vec<u8>>) -> u64 {
        let offset = self.next_offset;
        self.records.push(StoredRecord {
            offset,
            key,
            payload,
            timestamp: Utc::now(),
        });
        self.next_offset += 1;
        offset
    }

    fn read_from(&self, offset: u64, max: usize) -> &[StoredRecord] {
        let start = self.records.partition_point(|record| record.offset < offset);
        let end = (start + max).min(self.records.len());
        &self.records[start..end]
    }

    fn compact(&mut self) -> usize {
        let mut latest: HashMap<&str, u64> = HashMap::new();
        for record in &self.records {
            latest.insert(record.key.as_str(), record.offset);
        }
        let keep: Vec<u64> = self
            .records
            .iter()
            .filter(|record| {
                latest.get(record.key.as_str()) == Some(&record.offset) && record.payload.is_some()
            })
            .map(|record| record.offset)
            .collect();
        let before = self.records.len();
        self.records.retain(|record| keep.binary_search(&record.offset).is_ok());
        before - self.records.len()
    }
}

#[derive(Debug)]
struct TopicLog {
    compacted: bool,
    partitions: Vec<PartitionLog>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    committed: HashMap<(String, TopicPartition), u64>,
}

struct BrokerInner {
    default_partitions: u32,
    state: Mutex<BrokerState>,
    appended: Notify,
}

/// In-process partitioned log implementing the broker contract.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new(default_partitions: u32) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                default_partitions: default_partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                appended: Notify::new(),
            }),
        }
    }

    /// Creates every pipeline topic with the same partition count.
    pub fn with_pipeline_topics(partitions: u32) -> Self {
        let broker = Self::new(partitions);
        for topic in topics::ALL {
            broker.create_topic(topic, partitions, topics::COMPACTED.contains(topic));
        }
        broker
    }

    pub fn create_topic(&self, name: &str, partitions: u32, compacted: bool) {
        let mut state = self.inner.state.lock();
        state.topics.entry(name.to_string()).or_insert_with(|| TopicLog {
            compacted,
            partitions: (0..partitions.max(1)).map(|_| PartitionLog::default()).collect(),
        });
    }

    pub fn partition_count(&self, topic: &str) -> u32 {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|log| log.partitions.len() as u32)
            .unwrap_or(self.inner.default_partitions)
    }

    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer::new(self.clone(), DEFAULT_LINGER_RECORDS)
    }

    pub fn consumer(&self, group: impl Into<String>) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            group: group.into(),
            positions: BTreeMap::new(),
        }
    }

    /// Appends a record keyed by the shared partitioner.
    pub fn append(&self, topic: &str, key: &str, payload: Option<Vec<u8>>) -> RecordMetadata {
        let metadata = {
            let mut state = self.inner.state.lock();
            let log = self.topic_mut(&mut state, topic);
            let partition = partition_for(key, log.partitions.len() as u32);
            let offset = log.partitions[partition as usize].append(key.to_string(), payload);
            RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset,
            }
        };
        self.inner.appended.notify_waiters();
        metadata
    }

    /// Appends raw bytes to an explicit partition, bypassing the partitioner.
    pub fn append_to_partition(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: Option<Vec<u8>>,
    ) -> AppResult<RecordMetadata> {
        let metadata = {
            let mut state = self.inner.state.lock();
            let log = self.topic_mut(&mut state, topic);
            let slot = log
                .partitions
                .get_mut(partition as usize)
                .ok_or_else(|| AppError::Broker(format!("unknown partition {topic}-{partition}")))?;
            let offset = slot.append(key.to_string(), payload);
            RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset,
            }
        };
        self.inner.appended.notify_waiters();
        Ok(metadata)
    }

    pub fn end_offset(&self, topic: &str, partition: u32) -> u64 {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .map(|slot| slot.next_offset)
            .unwrap_or(0)
    }

    /// Number of records currently retained across all partitions.
    pub fn retained(&self, topic: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().map(|slot| slot.records.len()).sum())
            .unwrap_or(0)
    }

    /// Drops superseded records and tombstones from a compacted topic.
    pub fn compact(&self, topic: &str) -> usize {
        let mut state = self.inner.state.lock();
        let Some(log) = state.topics.get_mut(topic) else {
            return 0;
        };
        if !log.compacted {
            return 0;
        }
        let removed = log.partitions.iter_mut().map(PartitionLog::compact).sum();
        debug!(target: "broker", topic, removed, "compacted topic");
        removed
    }

    pub fn committed(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        let state = self.inner.state.lock();
        state
            .committed
            .get(&(group.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    fn topic_mut<'a>(&self, state: &'a mut BrokerState, topic: &str) -> &'a mut TopicLog {
        let partitions = self.inner.default_partitions;
        state.topics.entry(topic.to_string()).or_insert_with(|| TopicLog {
            compacted: topics::COMPACTED.contains(&topic),
            partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
        })
    }

    fn read(&self, partition: &TopicPartition, from: u64, max: usize) -> Vec<ConsumerRecord> {
        let state = self.inner.state.lock();
        let Some(slot) = state
            .topics
            .get(&partition.topic)
            .and_then(|log| log.partitions.get(partition.partition as usize))
        else {
            return Vec::new();
        };
        slot.read_from(from, max)
            .iter()
            .map(|record| ConsumerRecord {
                topic: partition.topic.clone(),
                partition: partition.partition,
                offset: record.offset,
                key: record.key.clone(),
                payload: record.payload.clone(),
                timestamp: record.timestamp,
            })
            .collect()
    }

    fn commit_positions(&self, group: &str, positions: &BTreeMap<TopicPartition, u64>) {
        let mut state = self.inner.state.lock();
        for (partition, offset) in positions {
            state
                .committed
                .insert((group.to_string(), partition.clone()), *offset);
        }
    }
}

pub struct InMemoryProducer {
    broker: InMemoryBroker,
    linger_records: usize,
    buffer: Mutex<Vec<(String, String, Option<Vec<u8>>)>>,
}

impl InMemoryProducer {
    pub fn new(broker: InMemoryBroker, linger_records: usize) -> Self {
        Self {
            broker,
            linger_records: linger_records.max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    fn drain(&self) -> usize {
        let pending = std::mem::take(&mut *self.buffer.lock());
        let count = pending.len();
        for (topic, key, payload) in pending {
            let metadata = self.broker.append(&topic, &key, payload);
            trace!(
                target: "broker",
                topic = %metadata.topic,
                partition = metadata.partition,
                offset = metadata.offset,
                "record appended"
            );
        }
        count
    }
}

#[async_trait]
impl RecordProducer for InMemoryProducer {
    async fn send(&self, topic: &str, key: &str, payload: Option<Vec<u8>>) -> AppResult<()> {
        let full = {
            let mut buffer = self.buffer.lock();
            buffer.push((topic.to_string(), key.to_string(), payload));
            buffer.len() >= self.linger_records
        };
        if full {
            self.drain();
        }
        Ok(())
    }

    async fn flush(&self) -> AppResult<()> {
        self.drain();
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        let flushed = self.drain();
        debug!(target: "broker", flushed, "producer closed");
        Ok(())
    }
}

pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    positions: BTreeMap<TopicPartition, u64>,
}

impl InMemoryConsumer {
    fn collect(&mut self, max_records: usize) -> Vec<ConsumerRecord> {
        let assigned = self.positions.len().max(1);
        let per_partition = (max_records / assigned).max(1);
        let mut batch = Vec::new();
        for (partition, position) in self.positions.iter_mut() {
            if batch.len() >= max_records {
                break;
            }
            let budget = per_partition.min(max_records - batch.len());
            let records = self.broker.read(partition, *position, budget);
            if let Some(last) = records.last() {
                *position = last.offset + 1;
            }
            batch.extend(records);
        }
        batch
    }
}

#[async_trait]
impl RecordConsumer for InMemoryConsumer {
    fn assign(&mut self, topic: &str, partitions: &[u32]) -> AppResult<()> {
        let available = self.broker.partition_count(topic);
        for partition in partitions {
            if *partition >= available {
                return Err(AppError::Broker(format!(
                    "cannot assign {topic}-{partition}: topic has {available} partitions"
                )));
            }
            let committed = self.broker.committed(&self.group, topic, *partition);
            self.positions
                .insert(TopicPartition::new(topic, *partition), committed.unwrap_or(0));
        }
        Ok(())
    }

    async fn poll(&mut self, max_records: usize, wait: Duration) -> AppResult<Vec<ConsumerRecord>> {
        let deadline = Instant::now() + wait;
        loop {
            let broker = self.broker.clone();
            let notified = broker.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.collect(max_records.max(1));
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                tokio::task::yield_now().await;
                return Ok(batch);
            }
            if timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn seek(&mut self, topic: &str, partition: u32, offset: u64) -> AppResult<()> {
        let key = TopicPartition::new(topic, partition);
        match self.positions.get_mut(&key) {
            Some(position) => {
                *position = offset;
                Ok(())
            }
            None => Err(AppError::Broker(format!(
                "cannot seek unassigned partition {topic}-{partition}"
            ))),
        }
    }

    fn position(&self, topic: &str, partition: u32) -> Option<u64> {
        self.positions
            .get(&TopicPartition::new(topic, partition))
            .copied()
    }

    fn rewind(&mut self) -> AppResult<()> {
        for (partition, position) in self.positions.iter_mut() {
            let committed = self
                .broker
                .committed(&self.group, &partition.topic, partition.partition)
                .unwrap_or(0);
            if *position != committed {
                debug!(
                    target: "broker",
                    topic = %partition.topic,
                    partition = partition.partition,
                    from = *position,
                    to = committed,
                    "consumer rewound to committed offset"
                );
                *position = committed;
            }
        }
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        self.broker.commit_positions(&self.group, &self.positions);
        Ok(())
    }
}
