use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::broker::{topics, RecordProducer};
use crate::cache::LookupCache;
use crate::codec;
use crate::errors::{AppError, AppResult};
use crate::model::{EnrichedEvent, LookupEntry, ResolutionResponse, SENTINEL_EVENT_TYPE};
use crate::pending::PendingStore;

/// What to do with a response that has no pending entry to join against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    #[default]
    Drop,
    Sentinel,
}

impl FromStr for OrphanPolicy {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(OrphanPolicy::Drop),
            "sentinel" => Ok(OrphanPolicy::Sentinel),
            other => Err(AppError::Config(format!("invalid orphan policy: {other}"))),
        }
    }
}

impl OrphanPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrphanPolicy::Drop => "drop",
            OrphanPolicy::Sentinel => "sentinel",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Resolved(EnrichedEvent),
    Orphaned { emitted: bool },
}

pub struct Reconciler {
    cache: Arc<LookupCache>,
    pending: Arc<PendingStore>,
    producer: Arc<dyn RecordProducer>,
    orphan_policy: OrphanPolicy,
}

impl Reconciler {
    pub fn new(
        cache: Arc<LookupCache>,
        pending: Arc<PendingStore>,
        producer: Arc<dyn RecordProducer>,
        orphan_policy: OrphanPolicy,
    ) -> Self {
        Self {
            cache,
            pending,
            producer,
            orphan_policy,
        }
    }

    /// Joins one response against the pending store. The cache update is
    /// always written through; the pending entry is retired only after the
    /// enriched event and the cache update are flushed.
    pub async fn reconcile(&self, response: &ResolutionResponse) -> AppResult<Reconciliation> {
        let key = response.key();
        let coordinates = response.coordinates();
        let lookup = LookupEntry::resolved(&key, coordinates, Utc::now());

        let Some(pending) = self.pending.get(&key) else {
            self.write_lookup(&lookup).await?;
            let emitted = match self.orphan_policy {
                OrphanPolicy::Drop => {
                    warn!(
                        target: "reconciliation",
                        key = %key,
                        "response without pending entry; cached but not emitted"
                    );
                    false
                }
                OrphanPolicy::Sentinel => {
                    let enriched = EnrichedEvent::new(&key, SENTINEL_EVENT_TYPE, coordinates);
                    self.write_enriched(&enriched).await?;
                    true
                }
            };
            self.producer.flush().await?;
            self.cache.apply(key, Some(lookup))?;
            return Ok(Reconciliation::Orphaned { emitted });
        };

        let enriched = EnrichedEvent::new(&key, pending.event_type.clone(), coordinates);
        self.write_enriched(&enriched).await?;
        self.write_lookup(&lookup).await?;
        self.producer.flush().await?;
        self.cache.apply(key.clone(), Some(lookup))?;
        self.pending.retire(&key).await?;
        debug!(
            target: "reconciliation",
            key = %key,
            event_type = %enriched.event_type,
            "pending address reconciled"
        );
        Ok(Reconciliation::Resolved(enriched))
    }

    async fn write_lookup(&self, entry: &LookupEntry) -> AppResult<()> {
        self.producer
            .send(topics::LOOKUP_SOURCE, &entry.address, Some(codec::encode(entry)?))
            .await
    }

    async fn write_enriched(&self, event: &EnrichedEvent) -> AppResult<()> {
        self.producer
            .send(topics::ENRICHED_OUTPUT, &event.address, Some(codec::encode(event)?))
            .await
    }
}
