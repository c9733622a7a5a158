use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::broker::{topics, InMemoryBroker, RecordProducer};
use crate::cache::LookupCache;
use crate::codec::DeserializingConsumer;
use crate::config::AppConfig;
use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};
use crate::geocode::GeocodeService;
use crate::pending::PendingStore;
use crate::pipeline::{Assignment, EnrichmentPipeline, PipelineConsumers, PipelineSettings};
use crate::resolver::{ResolverService, ResolverSettings};

pub const PIPELINE_GROUP: &str = "geo-streams-app";
pub const RESOLVER_GROUP: &str = "geo-lookup-ms";

const COMPACTION_TICK: Duration = Duration::from_millis(250);

/// Both processing units running as tokio tasks over one broker.
pub struct Deployment {
    shutdown: Arc<AtomicBool>,
    handles: Vec<(String, JoinHandle<AppResult<()>>)>,
    assignments: Vec<Assignment>,
    cache: Arc<LookupCache>,
    pending: Arc<PendingStore>,
}

impl Deployment {
    /// Restores keyed state and spawns every worker. With `db` set, the cache
    /// and pending store are mirrored to sqlite and reloaded from it.
    pub async fn start(
        config: &AppConfig,
        broker: InMemoryBroker,
        db: Option<SharedConnection>,
        geocode: GeocodeService,
    ) -> AppResult<Self> {
        let partitions = broker.partition_count(topics::RAW_EVENTS);
        let store_producer: Arc<dyn RecordProducer> = Arc::new(broker.producer());
        let (cache, pending) = match db {
            Some(db) => (
                Arc::new(LookupCache::open(db.clone())?),
                Arc::new(PendingStore::open(db, store_producer.clone())?),
            ),
            None => (
                Arc::new(LookupCache::in_memory()),
                Arc::new(PendingStore::in_memory(store_producer.clone())),
            ),
        };

        let mut restore = DeserializingConsumer::new(
            Box::new(broker.consumer(format!("{PIPELINE_GROUP}-restore"))),
            topics::PENDING_SOURCE,
        );
        restore.assign(&(0..partitions).collect::<Vec<_>>())?;
        pending.restore_from_changelog(&mut restore).await?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        let assignments = Assignment::split(partitions, config.pipeline_workers);
        let pipeline_settings = PipelineSettings::from_config(config);
        for assignment in &assignments {
            let consumers = PipelineConsumers {
                lookup: DeserializingConsumer::new(
                    Box::new(broker.consumer(PIPELINE_GROUP)),
                    topics::LOOKUP_SOURCE,
                ),
                raw: DeserializingConsumer::new(
                    Box::new(broker.consumer(PIPELINE_GROUP)),
                    topics::RAW_EVENTS,
                ),
                keyed: DeserializingConsumer::new(
                    Box::new(broker.consumer(PIPELINE_GROUP)),
                    topics::RAW_EVENTS_BY_ADDRESS,
                ),
                responses: DeserializingConsumer::new(
                    Box::new(broker.consumer(PIPELINE_GROUP)),
                    topics::RESOLUTION_RESPONSES,
                ),
            };
            let worker = EnrichmentPipeline::new(
                assignment.clone(),
                consumers,
                Arc::new(broker.producer()),
                cache.clone(),
                pending.clone(),
                pipeline_settings.clone(),
            )?;
            let name = format!("pipeline{:?}", assignment.partitions);
            handles.push((name, tokio::spawn(worker.run(shutdown.clone()))));
        }

        let resolver_settings = ResolverSettings::from_config(config);
        for assignment in Assignment::split(partitions, config.resolver_workers) {
            let worker = ResolverService::new(
                DeserializingConsumer::new(
                    Box::new(broker.consumer(RESOLVER_GROUP)),
                    topics::RESOLUTION_REQUESTS,
                ),
                &assignment.partitions,
                Arc::new(broker.producer()),
                geocode.clone(),
                resolver_settings.clone(),
            )?;
            let name = format!("resolver{:?}", assignment.partitions);
            handles.push((name, tokio::spawn(worker.run(shutdown.clone()))));
        }

        handles.push((
            "compaction".to_string(),
            tokio::spawn(compact_until_shutdown(
                broker,
                Duration::from_secs(config.expiry_sweep_interval_secs.max(1)),
                shutdown.clone(),
            )),
        ));

        info!(
            target: "runtime",
            partitions,
            pipeline_workers = assignments.len(),
            resolver_workers = config.resolver_workers.min(partitions as usize),
            restored_pending = pending.len(),
            cached = cache.len(),
            "deployment started"
        );

        Ok(Self {
            shutdown,
            handles,
            assignments,
            cache,
            pending,
        })
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn cache(&self) -> &Arc<LookupCache> {
        &self.cache
    }

    pub fn pending(&self) -> &Arc<PendingStore> {
        &self.pending
    }

    /// Raises the shutdown flag and waits for every worker to finish its
    /// current cycle. Returns the first worker failure, if any.
    pub async fn shutdown(self) -> AppResult<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut first_error = None;
        for (name, handle) in self.handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(err) => Err(AppError::Worker(format!("{name}: {err}"))),
            };
            if let Err(err) = outcome {
                error!(target: "runtime", worker = %name, ?err, "worker ended with error");
                first_error.get_or_insert(err);
            }
        }
        info!(target: "runtime", "deployment stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn compact_until_shutdown(
    broker: InMemoryBroker,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> AppResult<()> {
    let mut waited = Duration::ZERO;
    while !shutdown.load(Ordering::SeqCst) {
        sleep(COMPACTION_TICK).await;
        waited += COMPACTION_TICK;
        if waited < interval {
            continue;
        }
        waited = Duration::ZERO;
        for topic in topics::COMPACTED {
            let removed = broker.compact(topic);
            debug!(target: "runtime", topic, removed, "log compaction pass");
        }
    }
    Ok(())
}
