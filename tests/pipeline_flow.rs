use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use geo_enrich::broker::topics;
use geo_enrich::codec::{encode, Delivery, DeserializingConsumer};
use geo_enrich::geocode::{Candidate, GeocodeError, GeocodeQuery, GeocodeSettings};
use geo_enrich::model::{Coordinates, DeadLetter};
use geo_enrich::{
    db, AppConfig, Deployment, EnrichedEvent, GeocodeService, Geocoder, InMemoryBroker, RawEvent,
};

const PARTITIONS: u32 = 4;

/// Knows Marienplatz and Odeonsplatz; everything else has no results.
#[derive(Default)]
struct MunichGeocoder {
    calls: AtomicU32,
}

#[async_trait]
impl Geocoder for MunichGeocoder {
    fn name(&self) -> &'static str {
        "munich"
    }

    async fn geocode(&self, query: &GeocodeQuery) -> Result<Vec<Candidate>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let coordinates = if query.text.starts_with("marienplatz") {
            Coordinates {
                lat: 48.1374,
                lng: 11.5755,
            }
        } else if query.text.starts_with("odeonsplatz") {
            Coordinates {
                lat: 48.1427,
                lng: 11.5771,
            }
        } else {
            return Ok(Vec::new());
        };
        Ok(vec![Candidate {
            coordinates,
            formatted_address: None,
        }])
    }
}

fn config() -> AppConfig {
    AppConfig {
        broker_partitions: PARTITIONS,
        pipeline_workers: 2,
        resolver_workers: 2,
        poll_timeout_ms: 20,
        ..AppConfig::default()
    }
}

fn geocode_service(geocoder: Arc<MunichGeocoder>) -> GeocodeService {
    GeocodeService::with_geocoder(
        geocoder,
        GeocodeSettings {
            country_hint: Some("Germany".into()),
            region: None,
            language: None,
            timeout: Duration::from_secs(1),
            max_attempts: 2,
            rate_limit_qps: 1000,
            backoff_base: Duration::from_millis(1),
        },
    )
}

fn publish(broker: &InMemoryBroker, address: &str, event_type: &str) {
    let event = RawEvent {
        address: address.into(),
        event_type: event_type.into(),
    };
    broker.append(topics::RAW_EVENTS, event.key().as_str(), Some(encode(&event).unwrap()));
}

struct Reader<T> {
    consumer: DeserializingConsumer<T>,
    seen: Vec<T>,
}

impl<T: serde::de::DeserializeOwned> Reader<T> {
    fn new(broker: &InMemoryBroker, topic: &str) -> Self {
        let mut consumer = DeserializingConsumer::new(Box::new(broker.consumer("test-reader")), topic);
        consumer
            .assign(&(0..PARTITIONS).collect::<Vec<_>>())
            .unwrap();
        Self {
            consumer,
            seen: Vec::new(),
        }
    }

    async fn wait_for(&mut self, count: usize) -> &[T] {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.seen.len() < count && Instant::now() < deadline {
            for delivery in self
                .consumer
                .poll(100, Duration::from_millis(50))
                .await
                .unwrap()
            {
                if let Delivery::Record(record) = delivery {
                    self.seen.extend(record.value);
                }
            }
        }
        &self.seen
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn marienplatz_is_resolved_once_then_served_from_cache() {
    let broker = InMemoryBroker::with_pipeline_topics(PARTITIONS);
    let geocoder = Arc::new(MunichGeocoder::default());
    let deployment = Deployment::start(&config(), broker.clone(), None, geocode_service(geocoder.clone()))
        .await
        .unwrap();
    assert_eq!(deployment.assignments().len(), 2);

    let mut enriched: Reader<EnrichedEvent> = Reader::new(&broker, topics::ENRICHED_OUTPUT);

    publish(&broker, "Marienplatz, Munich", "concert");
    let first = enriched.wait_for(1).await.to_vec();
    assert_eq!(
        first,
        vec![EnrichedEvent {
            address: "marienplatz, munich".into(),
            event_type: "concert".into(),
            lat: 48.1374,
            lng: 11.5755,
        }]
    );

    publish(&broker, "  MARIENPLATZ,   Munich ", "market");
    let both = enriched.wait_for(2).await.to_vec();
    assert_eq!(both.len(), 2);
    assert_eq!(both[1].event_type, "market");
    assert_eq!((both[1].lat, both[1].lng), (48.1374, 11.5755));

    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
    assert!(deployment.pending().is_empty());
    assert_eq!(deployment.cache().len(), 1);

    deployment.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn poison_records_and_failed_resolutions_do_not_stall_other_events() {
    let broker = InMemoryBroker::with_pipeline_topics(PARTITIONS);
    let geocoder = Arc::new(MunichGeocoder::default());
    let deployment = Deployment::start(&config(), broker.clone(), None, geocode_service(geocoder))
        .await
        .unwrap();

    for partition in 0..PARTITIONS {
        broker
            .append_to_partition(topics::RAW_EVENTS, partition, "junk", Some(b"{\"address\":".to_vec()))
            .unwrap();
    }
    publish(&broker, "Nowhere Street 1", "concert");
    publish(&broker, "Odeonsplatz", "parade");

    let mut enriched: Reader<EnrichedEvent> = Reader::new(&broker, topics::ENRICHED_OUTPUT);
    let mut dead: Reader<DeadLetter> = Reader::new(&broker, topics::RESOLUTION_DEAD_LETTER);

    let events = enriched.wait_for(1).await.to_vec();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].address, "odeonsplatz");

    let letters = dead.wait_for(1).await.to_vec();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].address, "nowhere street 1");
    assert_eq!(letters[0].attempts, 1);

    // the dead-lettered address stays pending until expiry handles it
    assert_eq!(deployment.pending().len(), 1);
    deployment.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_restores_cache_from_state_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        data_dir: dir.path().to_path_buf(),
        ..config()
    };

    {
        let broker = InMemoryBroker::with_pipeline_topics(PARTITIONS);
        let db = db::bootstrap(&config.data_dir, &config.database_file_name)
            .unwrap()
            .into_shared();
        let geocoder = Arc::new(MunichGeocoder::default());
        let deployment = Deployment::start(&config, broker.clone(), Some(db), geocode_service(geocoder))
            .await
            .unwrap();
        publish(&broker, "Marienplatz, Munich", "concert");
        Reader::<EnrichedEvent>::new(&broker, topics::ENRICHED_OUTPUT)
            .wait_for(1)
            .await;
        deployment.shutdown().await.unwrap();
    }

    let broker = InMemoryBroker::with_pipeline_topics(PARTITIONS);
    let db = db::bootstrap(&config.data_dir, &config.database_file_name)
        .unwrap()
        .into_shared();
    let geocoder = Arc::new(MunichGeocoder::default());
    let deployment = Deployment::start(&config, broker.clone(), Some(db), geocode_service(geocoder.clone()))
        .await
        .unwrap();
    assert_eq!(deployment.cache().len(), 1);

    publish(&broker, "marienplatz, munich", "market");
    let events = Reader::<EnrichedEvent>::new(&broker, topics::ENRICHED_OUTPUT)
        .wait_for(1)
        .await
        .to_vec();
    assert_eq!(events[0].event_type, "market");
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);

    deployment.shutdown().await.unwrap();
}
