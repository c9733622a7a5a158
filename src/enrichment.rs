use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::broker::{topics, RecordProducer};
use crate::cache::LookupCache;
use crate::codec;
use crate::errors::AppResult;
use crate::model::{
    EnrichedEvent, KeyedEvent, MissingEvent, PendingEntry, RawEvent, ResolutionRequest,
};
use crate::pending::{PendingStore, UpsertOutcome};

pub fn key_event(event: RawEvent) -> KeyedEvent {
    KeyedEvent {
        key: event.key(),
        event,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Matched(EnrichedEvent),
    Missing(MissingEvent),
}

/// Looks the event up in the cache. Only an entry with both coordinates
/// counts as a match; placeholders fall through to the miss path.
pub fn join(event: &KeyedEvent, cache: &LookupCache) -> JoinOutcome {
    match cache.get(&event.key).and_then(|entry| entry.coordinates()) {
        Some(coordinates) => JoinOutcome::Matched(EnrichedEvent::new(
            &event.key,
            event.event.event_type.clone(),
            coordinates,
        )),
        None => JoinOutcome::Missing(MissingEvent {
            key: event.key.clone(),
            event_type: event.event.event_type.clone(),
        }),
    }
}

pub fn route(missing: &MissingEvent) -> ResolutionRequest {
    ResolutionRequest {
        address: missing.key.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Matched,
    /// The miss was recorded. `routed` is true only for the first miss of an
    /// address, which is the only one that produces a resolution request.
    Pended { routed: bool },
    Rejected,
}

pub struct EnrichmentStage {
    cache: Arc<LookupCache>,
    pending: Arc<PendingStore>,
    producer: Arc<dyn RecordProducer>,
}

impl EnrichmentStage {
    pub fn new(
        cache: Arc<LookupCache>,
        pending: Arc<PendingStore>,
        producer: Arc<dyn RecordProducer>,
    ) -> Self {
        Self {
            cache,
            pending,
            producer,
        }
    }

    pub async fn process(&self, event: &KeyedEvent) -> AppResult<StageOutcome> {
        if event.key.is_empty() {
            warn!(
                target: "enrichment",
                event_type = %event.event.event_type,
                "event without an address dropped"
            );
            return Ok(StageOutcome::Rejected);
        }

        match join(event, &self.cache) {
            JoinOutcome::Matched(enriched) => {
                self.producer
                    .send(
                        topics::ENRICHED_OUTPUT,
                        event.key.as_str(),
                        Some(codec::encode(&enriched)?),
                    )
                    .await?;
                Ok(StageOutcome::Matched)
            }
            JoinOutcome::Missing(missing) => {
                let outcome = self
                    .pending
                    .upsert(PendingEntry::for_miss(&missing, Utc::now()))
                    .await?;
                if outcome == UpsertOutcome::Replaced {
                    debug!(target: "enrichment", key = %missing.key, "address already pending");
                    return Ok(StageOutcome::Pended { routed: false });
                }
                self.send_request(&missing).await?;
                Ok(StageOutcome::Pended { routed: true })
            }
        }
    }

    /// Routes a resolution request for an address that is already pending.
    pub async fn send_request(&self, missing: &MissingEvent) -> AppResult<()> {
        let request = route(missing);
        self.producer
            .send(
                topics::RESOLUTION_REQUESTS,
                missing.key.as_str(),
                Some(codec::encode(&request)?),
            )
            .await?;
        debug!(target: "enrichment", key = %missing.key, "resolution requested");
        Ok(())
    }
}
