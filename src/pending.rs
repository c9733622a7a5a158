use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::broker::{topics, RecordProducer};
use crate::codec::{self, Delivery, DeserializingConsumer};
use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};
use crate::model::{AddressKey, PendingEntry};
use crate::state::KeyedStateStore;

const STORE_NAME: &str = "pending-store";
const RESTORE_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    Rerequest,
    Retire,
}

impl FromStr for ExpiryAction {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rerequest" | "re-request" => Ok(ExpiryAction::Rerequest),
            "retire" | "drop" => Ok(ExpiryAction::Retire),
            other => Err(AppError::Config(format!("invalid pending expiry action: {other}"))),
        }
    }
}

impl ExpiryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryAction::Rerequest => "rerequest",
            ExpiryAction::Retire => "retire",
        }
    }
}

/// Addresses awaiting resolution, written through to `pending-source`.
///
/// Each key is only ever written by the worker owning its partition, so the
/// read-merge-write in [`upsert`](Self::upsert) does not race.
pub struct PendingStore {
    store: KeyedStateStore<PendingEntry>,
    producer: Arc<dyn RecordProducer>,
}

impl PendingStore {
    pub fn in_memory(producer: Arc<dyn RecordProducer>) -> Self {
        Self {
            store: KeyedStateStore::in_memory(STORE_NAME),
            producer,
        }
    }

    pub fn open(db: SharedConnection, producer: Arc<dyn RecordProducer>) -> AppResult<Self> {
        Ok(Self {
            store: KeyedStateStore::open(STORE_NAME, db)?,
            producer,
        })
    }

    pub fn get(&self, key: &AddressKey) -> Option<Arc<PendingEntry>> {
        self.store.get(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Idempotent upsert. A repeated miss keeps the age and attempt count of
    /// the outstanding entry and only replaces its event type. The changelog
    /// record is flushed before this returns.
    pub async fn upsert(&self, mut entry: PendingEntry) -> AppResult<UpsertOutcome> {
        let key = entry.key();
        let outcome = match self.store.get(&key) {
            Some(existing) => {
                entry.pended_at = existing.pended_at.or(entry.pended_at);
                entry.attempts = existing.attempts.max(entry.attempts);
                UpsertOutcome::Replaced
            }
            None => UpsertOutcome::Created,
        };
        entry.address = key.to_string();
        entry.lat = None;
        entry.lng = None;
        self.write(key, entry).await?;
        Ok(outcome)
    }

    /// Marks an expired entry as re-requested.
    pub async fn refresh(&self, key: &AddressKey, now: DateTime<Utc>) -> AppResult<Option<PendingEntry>> {
        let Some(existing) = self.store.get(key) else {
            return Ok(None);
        };
        let mut entry = existing.as_ref().clone();
        entry.pended_at = Some(now);
        entry.attempts = entry.attempts.saturating_add(1);
        self.write(key.clone(), entry.clone()).await?;
        Ok(Some(entry))
    }

    /// Retires the entry with a tombstone. Returns the retired entry, if any.
    pub async fn retire(&self, key: &AddressKey) -> AppResult<Option<Arc<PendingEntry>>> {
        if self.store.get(key).is_none() {
            return Ok(None);
        }
        self.producer.send(topics::PENDING_SOURCE, key.as_str(), None).await?;
        self.producer.flush().await?;
        let retired = self.store.delete(key)?;
        debug!(target: "pending_store", key = %key, "pending entry retired");
        Ok(retired)
    }

    /// Entries pended longer than `ttl` ago, oldest first. Entries without a
    /// timestamp are treated as expired.
    pub fn expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> Vec<PendingEntry> {
        let cutoff = now - ttl;
        let mut expired: Vec<PendingEntry> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|(_, entry)| entry.pended_at.map(|at| at <= cutoff).unwrap_or(true))
            .map(|(_, entry)| entry.as_ref().clone())
            .collect();
        expired.sort_by_key(|entry| entry.pended_at);
        expired
    }

    /// Rebuilds local state by replaying `pending-source` from the consumer's
    /// current position. Restore consumers are throwaway, so nothing is committed.
    pub async fn restore_from_changelog(
        &self,
        consumer: &mut DeserializingConsumer<PendingEntry>,
    ) -> AppResult<usize> {
        let mut replayed = 0;
        loop {
            let batch = consumer.poll(RESTORE_BATCH, Duration::ZERO).await?;
            if batch.is_empty() {
                break;
            }
            for delivery in batch {
                match delivery {
                    Delivery::Record(record) => {
                        self.store
                            .apply_changelog(AddressKey::normalize(&record.key), record.value)?;
                        replayed += 1;
                    }
                    Delivery::Poison(err) => consumer.skip(&err)?,
                }
            }
        }
        info!(target: "pending_store", replayed, size = self.store.len(), "pending store restored");
        Ok(replayed)
    }

    async fn write(&self, key: AddressKey, entry: PendingEntry) -> AppResult<()> {
        let payload = codec::encode(&entry)?;
        self.producer
            .send(topics::PENDING_SOURCE, key.as_str(), Some(payload))
            .await?;
        self.producer.flush().await?;
        self.store.put(key, entry)?;
        Ok(())
    }
}
