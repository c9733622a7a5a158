use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::broker::topics;
use crate::codec::{Delivery, DeserializingConsumer};
use crate::db::SharedConnection;
use crate::errors::AppResult;
use crate::model::{AddressKey, LookupEntry};
use crate::state::KeyedStateStore;

const STORE_NAME: &str = "lookup-cache";
const SYNC_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    Applied,
    Stale,
    Removed,
}

/// Materialized view of `lookup-source`: address key to resolved coordinates.
pub struct LookupCache {
    store: KeyedStateStore<LookupEntry>,
}

impl LookupCache {
    pub fn in_memory() -> Self {
        Self {
            store: KeyedStateStore::in_memory(STORE_NAME),
        }
    }

    pub fn open(db: SharedConnection) -> AppResult<Self> {
        Ok(Self {
            store: KeyedStateStore::open(STORE_NAME, db)?,
        })
    }

    pub fn get(&self, key: &AddressKey) -> Option<Arc<LookupEntry>> {
        self.store.get(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Applies one `lookup-source` change. An entry stamped earlier than the
    /// stored one is ignored, so the most recent resolution wins.
    pub fn apply(&self, key: AddressKey, entry: Option<LookupEntry>) -> AppResult<CacheUpdate> {
        let Some(entry) = entry else {
            self.store.delete(&key)?;
            return Ok(CacheUpdate::Removed);
        };
        let written = self.store.put_if(key, entry, |current, next| {
            match (
                current.and_then(|c| c.resolved_at),
                next.resolved_at,
            ) {
                (Some(current), Some(next)) => next >= current,
                _ => true,
            }
        })?;
        Ok(if written {
            CacheUpdate::Applied
        } else {
            CacheUpdate::Stale
        })
    }
}

/// Drains `lookup-source` into a [`LookupCache`].
pub struct CacheMaterializer {
    consumer: DeserializingConsumer<LookupEntry>,
    cache: Arc<LookupCache>,
}

impl CacheMaterializer {
    pub fn new(
        mut consumer: DeserializingConsumer<LookupEntry>,
        cache: Arc<LookupCache>,
        partitions: &[u32],
    ) -> AppResult<Self> {
        debug_assert_eq!(consumer.topic(), topics::LOOKUP_SOURCE);
        consumer.assign(partitions)?;
        Ok(Self { consumer, cache })
    }

    /// Applies everything currently readable and returns the number of
    /// records consumed, poison records included.
    pub async fn sync(&mut self) -> AppResult<usize> {
        let mut consumed = 0;
        loop {
            let batch = self.consumer.poll(SYNC_BATCH, Duration::ZERO).await?;
            if batch.is_empty() {
                break;
            }
            for delivery in batch {
                consumed += 1;
                match delivery {
                    Delivery::Record(record) => {
                        let key = AddressKey::normalize(&record.key);
                        let update = self.cache.apply(key, record.value)?;
                        trace!(
                            target: "lookup_cache",
                            key = %record.key,
                            offset = record.offset,
                            ?update,
                            "lookup change applied"
                        );
                    }
                    Delivery::Poison(err) => self.consumer.skip(&err)?,
                }
            }
        }
        if consumed > 0 {
            self.consumer.commit().await?;
            debug!(target: "lookup_cache", consumed, size = self.cache.len(), "lookup cache synced");
        }
        Ok(consumed)
    }

    /// Drops uncommitted progress; replayed entries are applied idempotently.
    pub fn rewind(&mut self) -> AppResult<()> {
        self.consumer.rewind()
    }
}
