use std::collections::HashSet;
use std::marker::PhantomData;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::broker::{ConsumerRecord, RecordConsumer, TopicPartition};
use crate::errors::AppResult;

/// Structured decoding failure. Carries the exact position of the record so
/// the caller can seek past it without inspecting the message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("undecodable record at {topic}-{partition} offset {offset}: {cause}")]
pub struct DecodeError {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub cause: String,
}

pub fn encode<T: Serialize>(value: &T) -> AppResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decodes a record value; tombstones decode to `None`.
pub fn decode<T: DeserializeOwned>(record: &ConsumerRecord) -> Result<Option<T>, DecodeError> {
    let Some(payload) = record.payload.as_deref() else {
        return Ok(None);
    };
    serde_json::from_slice(payload)
        .map(Some)
        .map_err(|err| DecodeError {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            cause: err.to_string(),
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consumed<T> {
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub value: Option<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<T> {
    Record(Consumed<T>),
    Poison(DecodeError),
}

/// Wraps a raw consumer and decodes each record into `T`.
///
/// A record that fails to decode halts its partition for the rest of the
/// batch: the partition position is rewound to the poison offset and the
/// failure is surfaced as [`Delivery::Poison`]. Calling [`skip`](Self::skip)
/// moves past it. Other partitions keep flowing.
pub struct DeserializingConsumer<T> {
    topic: String,
    inner: Box<dyn RecordConsumer>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> DeserializingConsumer<T> {
    pub fn new(inner: Box<dyn RecordConsumer>, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            inner,
            _marker: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn assign(&mut self, partitions: &[u32]) -> AppResult<()> {
        self.inner.assign(&self.topic, partitions)
    }

    pub async fn poll(&mut self, max_records: usize, wait: Duration) -> AppResult<Vec<Delivery<T>>> {
        let records = self.inner.poll(max_records, wait).await?;
        let mut halted: HashSet<TopicPartition> = HashSet::new();
        let mut deliveries = Vec::with_capacity(records.len());
        for record in records {
            let partition = TopicPartition::new(record.topic.as_str(), record.partition);
            if halted.contains(&partition) {
                continue;
            }
            match decode::<T>(&record) {
                Ok(value) => deliveries.push(Delivery::Record(Consumed {
                    partition: record.partition,
                    offset: record.offset,
                    key: record.key,
                    value,
                })),
                Err(err) => {
                    self.inner.seek(&record.topic, record.partition, record.offset)?;
                    halted.insert(partition);
                    deliveries.push(Delivery::Poison(err));
                }
            }
        }
        Ok(deliveries)
    }

    /// Advances past a poison record reported by [`poll`](Self::poll).
    pub fn skip(&mut self, err: &DecodeError) -> AppResult<()> {
        warn!(
            target: "codec",
            topic = %err.topic,
            partition = err.partition,
            offset = err.offset,
            cause = %err.cause,
            "poison record found; skipping"
        );
        self.inner.seek(&err.topic, err.partition, err.offset + 1)
    }

    pub fn position(&self, partition: u32) -> Option<u64> {
        self.inner.position(&self.topic, partition)
    }

    /// Returns to the last committed offsets so an interrupted batch is
    /// delivered again.
    pub fn rewind(&mut self) -> AppResult<()> {
        self.inner.rewind()
    }

    pub async fn commit(&mut self) -> AppResult<()> {
        self.inner.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{topics, InMemoryBroker};
    use crate::model::RawEvent;

    fn raw(address: &str) -> Vec<u8> {
        encode(&RawEvent {
            address: address.into(),
            event_type: "concert".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn poison_record_halts_only_its_partition_until_skipped() {
        let broker = InMemoryBroker::with_pipeline_topics(1);
        broker
            .append_to_partition(topics::RAW_EVENTS, 0, "a", Some(raw("a")))
            .unwrap();
        broker
            .append_to_partition(topics::RAW_EVENTS, 0, "b", Some(b"{not json".to_vec()))
            .unwrap();
        broker
            .append_to_partition(topics::RAW_EVENTS, 0, "c", Some(raw("c")))
            .unwrap();

        let mut consumer: DeserializingConsumer<RawEvent> =
            DeserializingConsumer::new(Box::new(broker.consumer("g")), topics::RAW_EVENTS);
        consumer.assign(&[0]).unwrap();

        let first = consumer.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(matches!(&first[0], Delivery::Record(c) if c.offset == 0));
        let Delivery::Poison(err) = &first[1] else {
            panic!("expected poison delivery");
        };
        assert_eq!((err.partition, err.offset), (0, 1));
        assert_eq!(consumer.position(0), Some(1));

        consumer.skip(err).unwrap();
        let second = consumer.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(matches!(&second[0], Delivery::Record(c) if c.offset == 2 && c.key == "c"));
    }

    #[tokio::test]
    async fn tombstones_decode_to_none() {
        let broker = InMemoryBroker::with_pipeline_topics(1);
        broker.append(topics::PENDING_SOURCE, "a", None);
        let mut consumer: DeserializingConsumer<RawEvent> =
            DeserializingConsumer::new(Box::new(broker.consumer("g")), topics::PENDING_SOURCE);
        consumer.assign(&[0]).unwrap();
        let batch = consumer.poll(10, Duration::ZERO).await.unwrap();
        assert!(matches!(&batch[0], Delivery::Record(c) if c.value.is_none()));
    }
}
