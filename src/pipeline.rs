use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{partition_for, topics, RecordProducer};
use crate::cache::{CacheMaterializer, LookupCache};
use crate::codec::{self, Delivery, DeserializingConsumer};
use crate::config::AppConfig;
use crate::enrichment::{key_event, EnrichmentStage, StageOutcome};
use crate::errors::AppResult;
use crate::model::{AddressKey, LookupEntry, MissingEvent, RawEvent, ResolutionResponse};
use crate::pending::{ExpiryAction, PendingStore};
use crate::reconcile::{OrphanPolicy, Reconciler, Reconciliation};

const ERROR_BACKOFF: Duration = Duration::from_millis(500);
const MAX_IDLE_WAIT: Duration = Duration::from_millis(50);
const MAX_PENDING_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

/// Partitions owned by one worker. Every input topic is read on the same
/// partition numbers so keyed state is only touched by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub partitions: Vec<u32>,
    pub partition_count: u32,
}

impl Assignment {
    /// Spreads `partition_count` partitions round-robin over `workers`.
    /// Workers that would own nothing are not returned.
    pub fn split(partition_count: u32, workers: usize) -> Vec<Assignment> {
        let count = partition_count.max(1);
        let workers = workers.clamp(1, count as usize);
        (0..workers)
            .map(|worker| Assignment {
                partitions: (0..count)
                    .filter(|partition| *partition as usize % workers == worker)
                    .collect(),
                partition_count: count,
            })
            .collect()
    }

    pub fn owns(&self, key: &AddressKey) -> bool {
        self.partitions
            .contains(&partition_for(key.as_str(), self.partition_count))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub poll_max_records: usize,
    pub idle_wait: Duration,
    pub orphan_policy: OrphanPolicy,
    pub pending_ttl: chrono::Duration,
    pub expiry_action: ExpiryAction,
    pub max_rerequests: u32,
    pub sweep_interval: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_max_records: config.poll_max_records.max(1),
            idle_wait: Duration::from_millis(config.poll_timeout_ms).min(MAX_IDLE_WAIT),
            orphan_policy: config.orphan_policy,
            pending_ttl: chrono::Duration::seconds(
                config.pending_ttl_secs.min(MAX_PENDING_TTL_SECS) as i64,
            ),
            expiry_action: config.pending_expiry_action,
            max_rerequests: config.pending_max_rerequests,
            sweep_interval: Duration::from_secs(config.expiry_sweep_interval_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cache_updates: usize,
    pub reconciled: usize,
    pub orphaned: usize,
    pub repartitioned: usize,
    pub matched: usize,
    pub pended: usize,
    pub routed: usize,
    pub rejected: usize,
    pub poisoned: usize,
    pub rerequested: usize,
    pub expired: usize,
}

impl CycleStats {
    pub fn is_idle(&self) -> bool {
        *self == CycleStats::default()
    }
}

pub struct PipelineConsumers {
    pub lookup: DeserializingConsumer<LookupEntry>,
    pub raw: DeserializingConsumer<RawEvent>,
    pub keyed: DeserializingConsumer<RawEvent>,
    pub responses: DeserializingConsumer<ResolutionResponse>,
}

/// One worker of the enrichment unit: keyer, cache join, pending store,
/// router and reconciliation over its assigned partitions.
pub struct EnrichmentPipeline {
    assignment: Assignment,
    materializer: CacheMaterializer,
    raw: DeserializingConsumer<RawEvent>,
    keyed: DeserializingConsumer<RawEvent>,
    responses: DeserializingConsumer<ResolutionResponse>,
    producer: Arc<dyn RecordProducer>,
    pending: Arc<PendingStore>,
    stage: EnrichmentStage,
    reconciler: Reconciler,
    settings: PipelineSettings,
    last_sweep: Instant,
}

impl EnrichmentPipeline {
    pub fn new(
        assignment: Assignment,
        consumers: PipelineConsumers,
        producer: Arc<dyn RecordProducer>,
        cache: Arc<LookupCache>,
        pending: Arc<PendingStore>,
        settings: PipelineSettings,
    ) -> AppResult<Self> {
        let PipelineConsumers {
            lookup,
            mut raw,
            mut keyed,
            mut responses,
        } = consumers;
        let materializer = CacheMaterializer::new(lookup, cache.clone(), &assignment.partitions)?;
        raw.assign(&assignment.partitions)?;
        keyed.assign(&assignment.partitions)?;
        responses.assign(&assignment.partitions)?;

        let stage = EnrichmentStage::new(cache.clone(), pending.clone(), producer.clone());
        let reconciler = Reconciler::new(
            cache,
            pending.clone(),
            producer.clone(),
            settings.orphan_policy,
        );
        Ok(Self {
            assignment,
            materializer,
            raw,
            keyed,
            responses,
            producer,
            pending,
            stage,
            reconciler,
            settings,
            last_sweep: Instant::now(),
        })
    }

    /// One pass over every input: cache changes first so the join sees the
    /// freshest view, then responses, then new events.
    ///
    /// On failure every input is rewound to its committed offsets, so the
    /// next cycle sees the interrupted batch again.
    pub async fn run_cycle(&mut self) -> AppResult<CycleStats> {
        match self.cycle().await {
            Ok(stats) => Ok(stats),
            Err(err) => {
                self.rewind()?;
                Err(err)
            }
        }
    }

    fn rewind(&mut self) -> AppResult<()> {
        self.materializer.rewind()?;
        self.responses.rewind()?;
        self.raw.rewind()?;
        self.keyed.rewind()
    }

    async fn cycle(&mut self) -> AppResult<CycleStats> {
        let mut stats = CycleStats {
            cache_updates: self.materializer.sync().await?,
            ..CycleStats::default()
        };
        self.reconcile_responses(&mut stats).await?;
        self.repartition_raw(&mut stats).await?;
        self.join_keyed(&mut stats).await?;

        if self.last_sweep.elapsed() >= self.settings.sweep_interval {
            let (rerequested, expired) = self.sweep_expired(Utc::now()).await?;
            stats.rerequested = rerequested;
            stats.expired = expired;
            self.last_sweep = Instant::now();
        }
        if !stats.is_idle() {
            debug!(target: "pipeline", partitions = ?self.assignment.partitions, ?stats, "pipeline cycle complete");
        }
        Ok(stats)
    }

    /// Handles pending entries older than the configured TTL on this worker's
    /// partitions. Returns `(rerequested, retired)`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> AppResult<(usize, usize)> {
        let mut rerequested = 0;
        let mut retired = 0;
        for entry in self.pending.expired(now, self.settings.pending_ttl) {
            let key = entry.key();
            if !self.assignment.owns(&key) {
                continue;
            }
            let exhausted = entry.attempts.saturating_sub(1) >= self.settings.max_rerequests;
            if self.settings.expiry_action == ExpiryAction::Retire || exhausted {
                warn!(
                    target: "pipeline",
                    key = %key,
                    attempts = entry.attempts,
                    pended_at = ?entry.pended_at,
                    "pending entry expired unresolved; retiring"
                );
                self.pending.retire(&key).await?;
                retired += 1;
                continue;
            }
            if self.pending.refresh(&key, now).await?.is_some() {
                self.stage
                    .send_request(&MissingEvent {
                        key,
                        event_type: entry.event_type.clone(),
                    })
                    .await?;
                rerequested += 1;
            }
        }
        if rerequested + retired > 0 {
            self.producer.flush().await?;
            info!(target: "pipeline", rerequested, retired, "expired pending entries handled");
        }
        Ok((rerequested, retired))
    }

    pub async fn run(mut self, shutdown: Arc<AtomicBool>) -> AppResult<()> {
        info!(
            target: "pipeline",
            partitions = ?self.assignment.partitions,
            "enrichment worker started"
        );
        while !shutdown.load(Ordering::SeqCst) {
            match self.run_cycle().await {
                Ok(stats) if stats.is_idle() => sleep(self.settings.idle_wait).await,
                Ok(_) => {}
                Err(err) if err.is_transient() => {
                    warn!(target: "pipeline", ?err, "pipeline cycle failed; backing off");
                    sleep(ERROR_BACKOFF).await;
                }
                Err(err) => {
                    error!(target: "pipeline", ?err, "enrichment worker stopped");
                    self.producer.close().await?;
                    return Err(err);
                }
            }
        }
        self.producer.close().await?;
        info!(target: "pipeline", partitions = ?self.assignment.partitions, "enrichment worker stopped");
        Ok(())
    }

    async fn reconcile_responses(&mut self, stats: &mut CycleStats) -> AppResult<()> {
        let batch = self
            .responses
            .poll(self.settings.poll_max_records, Duration::ZERO)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }
        for delivery in batch {
            match delivery {
                Delivery::Record(record) => {
                    let Some(response) = record.value else {
                        continue;
                    };
                    match self.reconciler.reconcile(&response).await? {
                        Reconciliation::Resolved(_) => stats.reconciled += 1,
                        Reconciliation::Orphaned { .. } => stats.orphaned += 1,
                    }
                }
                Delivery::Poison(err) => {
                    self.responses.skip(&err)?;
                    stats.poisoned += 1;
                }
            }
        }
        self.responses.commit().await
    }

    async fn repartition_raw(&mut self, stats: &mut CycleStats) -> AppResult<()> {
        let batch = self
            .raw
            .poll(self.settings.poll_max_records, Duration::ZERO)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }
        for delivery in batch {
            match delivery {
                Delivery::Record(record) => {
                    let Some(event) = record.value else {
                        continue;
                    };
                    let keyed = key_event(event);
                    if keyed.key.is_empty() {
                        warn!(
                            target: "pipeline",
                            partition = record.partition,
                            offset = record.offset,
                            "raw event without an address dropped"
                        );
                        stats.rejected += 1;
                        continue;
                    }
                    self.producer
                        .send(
                            topics::RAW_EVENTS_BY_ADDRESS,
                            keyed.key.as_str(),
                            Some(codec::encode(&keyed.event)?),
                        )
                        .await?;
                    stats.repartitioned += 1;
                }
                Delivery::Poison(err) => {
                    self.raw.skip(&err)?;
                    stats.poisoned += 1;
                }
            }
        }
        self.producer.flush().await?;
        self.raw.commit().await
    }

    async fn join_keyed(&mut self, stats: &mut CycleStats) -> AppResult<()> {
        let batch = self
            .keyed
            .poll(self.settings.poll_max_records, Duration::ZERO)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }
        for delivery in batch {
            match delivery {
                Delivery::Record(record) => {
                    let Some(event) = record.value else {
                        continue;
                    };
                    match self.stage.process(&key_event(event)).await? {
                        StageOutcome::Matched => stats.matched += 1,
                        StageOutcome::Pended { routed } => {
                            stats.pended += 1;
                            if routed {
                                stats.routed += 1;
                            }
                        }
                        StageOutcome::Rejected => stats.rejected += 1,
                    }
                }
                Delivery::Poison(err) => {
                    self.keyed.skip(&err)?;
                    stats.poisoned += 1;
                }
            }
        }
        self.producer.flush().await?;
        self.keyed.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::test_support::FlakyProducer;
    use crate::broker::InMemoryBroker;
    use crate::model::{Coordinates, PendingEntry};

    const GROUP: &str = "pipeline-test";

    fn settings() -> PipelineSettings {
        PipelineSettings {
            poll_max_records: 50,
            idle_wait: Duration::from_millis(5),
            orphan_policy: OrphanPolicy::Drop,
            pending_ttl: chrono::Duration::minutes(15),
            expiry_action: ExpiryAction::Rerequest,
            max_rerequests: 1,
            sweep_interval: Duration::from_secs(3600),
        }
    }

    fn consumers(broker: &InMemoryBroker) -> PipelineConsumers {
        PipelineConsumers {
            lookup: DeserializingConsumer::new(Box::new(broker.consumer(GROUP)), topics::LOOKUP_SOURCE),
            raw: DeserializingConsumer::new(Box::new(broker.consumer(GROUP)), topics::RAW_EVENTS),
            keyed: DeserializingConsumer::new(
                Box::new(broker.consumer(GROUP)),
                topics::RAW_EVENTS_BY_ADDRESS,
            ),
            responses: DeserializingConsumer::new(
                Box::new(broker.consumer(GROUP)),
                topics::RESOLUTION_RESPONSES,
            ),
        }
    }

    fn pipeline(broker: &InMemoryBroker, settings: PipelineSettings) -> (EnrichmentPipeline, Arc<PendingStore>) {
        pipeline_with(broker, settings, Arc::new(broker.producer()))
    }

    fn pipeline_with(
        broker: &InMemoryBroker,
        settings: PipelineSettings,
        producer: Arc<dyn RecordProducer>,
    ) -> (EnrichmentPipeline, Arc<PendingStore>) {
        let pending = Arc::new(PendingStore::in_memory(producer.clone()));
        let pipeline = EnrichmentPipeline::new(
            Assignment::split(1, 1).remove(0),
            consumers(broker),
            producer,
            Arc::new(LookupCache::in_memory()),
            pending.clone(),
            settings,
        )
        .unwrap();
        (pipeline, pending)
    }

    fn raw(broker: &InMemoryBroker, address: &str, event_type: &str) {
        let payload = codec::encode(&RawEvent {
            address: address.into(),
            event_type: event_type.into(),
        })
        .unwrap();
        broker.append(topics::RAW_EVENTS, address, Some(payload));
    }

    #[test]
    fn split_assigns_each_partition_once() {
        let assignments = Assignment::split(5, 2);
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].partitions, vec![0, 2, 4]);
        assert_eq!(assignments[1].partitions, vec![1, 3]);
        assert_eq!(Assignment::split(2, 8).len(), 2);

        let key = AddressKey::normalize("marienplatz, munich");
        let owners = assignments.iter().filter(|a| a.owns(&key)).count();
        assert_eq!(owners, 1);
    }

    #[tokio::test]
    async fn miss_pends_and_routes_once_then_reconciles() {
        let broker = InMemoryBroker::with_pipeline_topics(1);
        let (mut pipeline, pending) = pipeline(&broker, settings());
        raw(&broker, "Marienplatz, Munich", "concert");
        raw(&broker, "marienplatz,  munich", "festival");

        let stats = pipeline.run_cycle().await.unwrap();
        assert_eq!(stats.repartitioned, 2);
        assert_eq!(stats.pended, 2);
        assert_eq!(stats.routed, 1);
        assert_eq!(broker.end_offset(topics::RESOLUTION_REQUESTS, 0), 1);

        let response = ResolutionResponse {
            address: "marienplatz, munich".into(),
            lat: 48.1374,
            lng: 11.5755,
        };
        broker.append(
            topics::RESOLUTION_RESPONSES,
            "marienplatz, munich",
            Some(codec::encode(&response).unwrap()),
        );
        let stats = pipeline.run_cycle().await.unwrap();
        assert_eq!(stats.reconciled, 1);
        assert!(pending.is_empty());
        assert_eq!(broker.end_offset(topics::ENRICHED_OUTPUT, 0), 1);

        raw(&broker, "MARIENPLATZ, MUNICH", "market");
        let stats = pipeline.run_cycle().await.unwrap();
        assert_eq!(stats.matched, 1);
        assert_eq!(broker.end_offset(topics::RESOLUTION_REQUESTS, 0), 1);
        assert_eq!(broker.end_offset(topics::ENRICHED_OUTPUT, 0), 2);
    }

    #[tokio::test]
    async fn poison_raw_event_is_skipped() {
        let broker = InMemoryBroker::with_pipeline_topics(1);
        let (mut pipeline, _) = pipeline(&broker, settings());
        broker.append(topics::RAW_EVENTS, "bad", Some(b"\x00\x01".to_vec()));
        raw(&broker, "Odeonsplatz", "parade");

        let mut poisoned = 0;
        let mut pended = 0;
        for _ in 0..3 {
            let stats = pipeline.run_cycle().await.unwrap();
            poisoned += stats.poisoned;
            pended += stats.pended;
        }
        assert_eq!(poisoned, 1);
        assert_eq!(pended, 1);
    }

    #[tokio::test]
    async fn expiry_rerequests_then_retires() {
        let broker = InMemoryBroker::with_pipeline_topics(1);
        let (pipeline, pending) = pipeline(&broker, settings());
        let now = Utc::now();
        let key = AddressKey::normalize("Nowhere 1");
        pending
            .upsert(PendingEntry::for_miss(
                &MissingEvent {
                    key: key.clone(),
                    event_type: "concert".into(),
                },
                now - chrono::Duration::hours(1),
            ))
            .await
            .unwrap();

        assert_eq!(pipeline.sweep_expired(now).await.unwrap(), (1, 0));
        assert_eq!(broker.end_offset(topics::RESOLUTION_REQUESTS, 0), 1);
        assert_eq!(pending.get(&key).unwrap().attempts, 2);

        let later = now + chrono::Duration::hours(1);
        assert_eq!(pipeline.sweep_expired(later).await.unwrap(), (0, 1));
        assert!(pending.get(&key).is_none());
    }

    #[tokio::test]
    async fn retire_action_drops_expired_entries() {
        let broker = InMemoryBroker::with_pipeline_topics(1);
        let mut settings = settings();
        settings.expiry_action = ExpiryAction::Retire;
        let (pipeline, pending) = pipeline(&broker, settings);
        let now = Utc::now();
        pending
            .upsert(PendingEntry::for_miss(
                &MissingEvent {
                    key: AddressKey::normalize("a"),
                    event_type: "x".into(),
                },
                now - chrono::Duration::hours(1),
            ))
            .await
            .unwrap();
        assert_eq!(pipeline.sweep_expired(now).await.unwrap(), (0, 1));
        assert_eq!(broker.end_offset(topics::RESOLUTION_REQUESTS, 0), 0);
    }

    #[tokio::test]
    async fn cached_lookup_matches_without_request() {
        let broker = InMemoryBroker::with_pipeline_topics(1);
        let (mut pipeline, _) = pipeline(&broker, settings());
        let key = AddressKey::normalize("Karlsplatz");
        let entry = LookupEntry::resolved(&key, Coordinates { lat: 48.139, lng: 11.566 }, Utc::now());
        broker.append(topics::LOOKUP_SOURCE, key.as_str(), Some(codec::encode(&entry).unwrap()));
        raw(&broker, "karlsplatz", "demo");

        let stats = pipeline.run_cycle().await.unwrap();
        assert_eq!(stats.cache_updates, 1);
        assert_eq!(stats.matched, 1);
        assert_eq!(broker.end_offset(topics::RESOLUTION_REQUESTS, 0), 0);
    }

    #[tokio::test]
    async fn failed_cycle_replays_its_batch() {
        let broker = InMemoryBroker::with_pipeline_topics(1);
        let producer = Arc::new(FlakyProducer::new(&broker, topics::PENDING_SOURCE, 1));
        let (mut pipeline, pending) = pipeline_with(&broker, settings(), producer);
        raw(&broker, "Marienplatz, Munich", "concert");
        raw(&broker, "Odeonsplatz", "parade");

        let err = pipeline.run_cycle().await.unwrap_err();
        assert!(err.is_transient());
        assert!(pending.is_empty());

        let mut pended = 0;
        for _ in 0..3 {
            pended += pipeline.run_cycle().await.unwrap().pended;
        }
        assert_eq!(pended, 2);
        assert_eq!(pending.len(), 2);
        assert_eq!(broker.end_offset(topics::RESOLUTION_REQUESTS, 0), 2);
        assert_eq!(
            broker.committed(GROUP, topics::RAW_EVENTS_BY_ADDRESS, 0),
            Some(broker.end_offset(topics::RAW_EVENTS_BY_ADDRESS, 0))
        );
    }

    #[tokio::test]
    async fn failed_reconcile_is_retried() {
        let broker = InMemoryBroker::with_pipeline_topics(1);
        let producer = Arc::new(FlakyProducer::new(&broker, topics::ENRICHED_OUTPUT, 1));
        let (mut pipeline, pending) = pipeline_with(&broker, settings(), producer);
        raw(&broker, "Odeonsplatz", "parade");
        pipeline.run_cycle().await.unwrap();
        assert_eq!(pending.len(), 1);

        let response = ResolutionResponse {
            address: "odeonsplatz".into(),
            lat: 48.1427,
            lng: 11.5771,
        };
        broker.append(
            topics::RESOLUTION_RESPONSES,
            "odeonsplatz",
            Some(codec::encode(&response).unwrap()),
        );
        assert!(pipeline.run_cycle().await.unwrap_err().is_transient());
        assert_eq!(pending.len(), 1);

        let stats = pipeline.run_cycle().await.unwrap();
        assert_eq!(stats.reconciled, 1);
        assert!(pending.is_empty());
        assert_eq!(broker.end_offset(topics::ENRICHED_OUTPUT, 0), 1);
    }
}
