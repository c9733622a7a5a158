use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::broker::{topics, RecordProducer};
use crate::codec::{self, Delivery, DeserializingConsumer};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geocode::{GeocodeService, Resolution};
use crate::model::{AddressKey, DeadLetter, ResolutionRequest, ResolutionResponse};

const ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Flush after every produced record.
    #[default]
    PerRecord,
    /// Flush once per polled batch.
    PerBatch,
}

impl FromStr for FlushPolicy {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "per-record" | "record" => Ok(FlushPolicy::PerRecord),
            "per-batch" | "batch" => Ok(FlushPolicy::PerBatch),
            other => Err(AppError::Config(format!("invalid flush policy: {other}"))),
        }
    }
}

impl FlushPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushPolicy::PerRecord => "per-record",
            FlushPolicy::PerBatch => "per-batch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub poll_timeout: Duration,
    pub poll_max_records: usize,
    pub concurrency: usize,
    pub flush_policy: FlushPolicy,
}

impl ResolverSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            poll_max_records: config.poll_max_records.max(1),
            concurrency: config.resolver_concurrency.max(1),
            flush_policy: config.resolver_flush_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub polled: usize,
    pub resolved: usize,
    pub dead_lettered: usize,
    pub poisoned: usize,
}

/// Consume-geocode-produce loop over `resolution-requests`.
pub struct ResolverService {
    consumer: DeserializingConsumer<ResolutionRequest>,
    producer: Arc<dyn RecordProducer>,
    geocode: GeocodeService,
    settings: ResolverSettings,
}

impl ResolverService {
    pub fn new(
        mut consumer: DeserializingConsumer<ResolutionRequest>,
        partitions: &[u32],
        producer: Arc<dyn RecordProducer>,
        geocode: GeocodeService,
        settings: ResolverSettings,
    ) -> AppResult<Self> {
        consumer.assign(partitions)?;
        Ok(Self {
            consumer,
            producer,
            geocode,
            settings,
        })
    }

    /// One poll-resolve-produce cycle. Offsets are committed only after the
    /// batch has been produced and flushed; a failed cycle rewinds to them.
    pub async fn run_cycle(&mut self) -> AppResult<ResolverStats> {
        match self.cycle().await {
            Ok(stats) => Ok(stats),
            Err(err) => {
                self.consumer.rewind()?;
                Err(err)
            }
        }
    }

    async fn cycle(&mut self) -> AppResult<ResolverStats> {
        let batch = self
            .consumer
            .poll(self.settings.poll_max_records, self.settings.poll_timeout)
            .await?;
        let mut stats = ResolverStats {
            polled: batch.len(),
            ..ResolverStats::default()
        };
        if batch.is_empty() {
            return Ok(stats);
        }

        let mut keys = Vec::with_capacity(batch.len());
        for delivery in batch {
            match delivery {
                Delivery::Record(record) => match record.value {
                    Some(request) if !request.key().is_empty() => keys.push(request.key()),
                    Some(_) => warn!(
                        target: "resolver",
                        partition = record.partition,
                        offset = record.offset,
                        "request without address ignored"
                    ),
                    None => {}
                },
                Delivery::Poison(err) => {
                    self.consumer.skip(&err)?;
                    stats.poisoned += 1;
                }
            }
        }

        let geocode = self.geocode.clone();
        let mut resolutions = stream::iter(keys)
            .map(move |key| {
                let geocode = geocode.clone();
                async move {
                    let resolution = geocode.resolve(&key).await;
                    (key, resolution)
                }
            })
            .buffered(self.settings.concurrency);

        while let Some((key, resolution)) = resolutions.next().await {
            match resolution {
                Resolution::Resolved { coordinates, .. } => {
                    let response = ResolutionResponse {
                        address: key.to_string(),
                        lat: coordinates.lat,
                        lng: coordinates.lng,
                    };
                    self.produce(topics::RESOLUTION_RESPONSES, &key, codec::encode(&response)?)
                        .await?;
                    stats.resolved += 1;
                }
                Resolution::Failed { error, attempts } => {
                    warn!(
                        target: "resolver",
                        key = %key,
                        ?error,
                        attempts,
                        "resolution failed; dead-lettering request"
                    );
                    let letter = DeadLetter {
                        address: key.to_string(),
                        reason: error.to_string(),
                        attempts,
                        failed_at: Utc::now(),
                    };
                    self.produce(topics::RESOLUTION_DEAD_LETTER, &key, codec::encode(&letter)?)
                        .await?;
                    stats.dead_lettered += 1;
                }
            }
        }

        if self.settings.flush_policy == FlushPolicy::PerBatch {
            self.producer.flush().await?;
        }
        self.consumer.commit().await?;
        debug!(target: "resolver", ?stats, "resolver cycle complete");
        Ok(stats)
    }

    /// Runs until `shutdown` is raised, then commits and closes the producer.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) -> AppResult<()> {
        info!(
            target: "resolver",
            provider = self.geocode.provider(),
            concurrency = self.settings.concurrency,
            flush_policy = self.settings.flush_policy.as_str(),
            "resolver started"
        );
        while !shutdown.load(Ordering::SeqCst) {
            match self.run_cycle().await {
                Ok(_) => {}
                Err(err) if err.is_transient() => {
                    warn!(target: "resolver", ?err, "resolver cycle failed; backing off");
                    sleep(ERROR_BACKOFF).await;
                }
                Err(err) => {
                    error!(target: "resolver", ?err, "resolver stopped");
                    self.producer.close().await?;
                    return Err(err);
                }
            }
        }
        self.consumer.commit().await?;
        self.producer.close().await?;
        info!(target: "resolver", "resolver stopped");
        Ok(())
    }

    async fn produce(&self, topic: &str, key: &AddressKey, payload: Vec<u8>) -> AppResult<()> {
        self.producer.send(topic, key.as_str(), Some(payload)).await?;
        if self.settings.flush_policy == FlushPolicy::PerRecord {
            self.producer.flush().await?;
        }
        Ok(())
    }
}
