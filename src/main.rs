use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use geo_enrich::broker::topics;
use geo_enrich::codec::{Delivery, DeserializingConsumer};
use geo_enrich::geocode::Resolution;
use geo_enrich::model::ResolutionResponse;
use geo_enrich::{
    db, init_tracing, AddressKey, AppConfig, Deployment, EnrichedEvent, GeocodeService,
    InMemoryBroker, RawEvent, RecordProducer,
};

const OUTPUT_GROUP: &str = "geo-enrich-cli";
const OUTPUT_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "geo-enrich")]
#[command(about = "Enrich address-tagged events with coordinates")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the enrichment pipeline and the resolver on an in-process broker
    Run {
        /// JSON-lines file of raw events; reads stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
        /// Stop this many seconds after the input ends instead of waiting for Ctrl-C
        #[arg(long)]
        linger_secs: Option<u64>,
    },
    /// Geocode a single address with the configured provider
    Resolve { address: String },
    /// Print the effective configuration without secrets
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Run { input, linger_secs } => run(config, input, linger_secs).await,
        Commands::Resolve { address } => resolve(&config, &address).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.public_profile())?);
            Ok(())
        }
    }
}

async fn run(config: AppConfig, input: Option<PathBuf>, linger_secs: Option<u64>) -> anyhow::Result<()> {
    let bootstrap = db::bootstrap(&config.data_dir, &config.database_file_name)
        .context("failed to open state database")?;
    if bootstrap.recovered {
        warn!("state database was unreadable and has been recreated");
    }
    let broker = InMemoryBroker::with_pipeline_topics(config.broker_partitions);
    let geocode = GeocodeService::new(&config)?;
    let deployment =
        Deployment::start(&config, broker.clone(), Some(bootstrap.into_shared()), geocode).await?;

    let printer_stop = Arc::new(AtomicBool::new(false));
    let printer = tokio::spawn(print_enriched(
        broker.clone(),
        config.broker_partitions,
        printer_stop.clone(),
    ));

    let ingested = match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            ingest(BufReader::new(file), &broker).await?
        }
        None => ingest(BufReader::new(tokio::io::stdin()), &broker).await?,
    };
    info!(ingested, "input exhausted");

    match linger_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    info!("shutting down");
    let result = deployment.shutdown().await;
    printer_stop.store(true, Ordering::SeqCst);
    printer.await??;
    result?;
    Ok(())
}

/// Appends every line to `raw-events`, keyed by normalized address so every
/// spelling of one address shares a partition. Lines that are not valid
/// events are still forwarded so the pipeline's poison handling applies to
/// them.
async fn ingest<R>(reader: R, broker: &InMemoryBroker) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let producer = broker.producer();
    let mut lines = reader.lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let key = serde_json::from_str::<RawEvent>(&line)
            .map(|event| event.key().to_string())
            .unwrap_or_default();
        producer
            .send(topics::RAW_EVENTS, &key, Some(line.into_bytes()))
            .await?;
        count += 1;
    }
    producer.close().await?;
    Ok(count)
}

async fn print_enriched(
    broker: InMemoryBroker,
    partitions: u32,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut consumer: DeserializingConsumer<EnrichedEvent> =
        DeserializingConsumer::new(Box::new(broker.consumer(OUTPUT_GROUP)), topics::ENRICHED_OUTPUT);
    consumer.assign(&(0..partitions.max(1)).collect::<Vec<_>>())?;
    let mut stdout = tokio::io::stdout();
    loop {
        let stopping = stop.load(Ordering::SeqCst);
        let wait = if stopping { Duration::ZERO } else { OUTPUT_POLL };
        let batch = consumer.poll(500, wait).await?;
        if batch.is_empty() && stopping {
            break;
        }
        for delivery in batch {
            match delivery {
                Delivery::Record(record) => {
                    if let Some(event) = record.value {
                        let mut line = serde_json::to_vec(&event)?;
                        line.push(b'\n');
                        stdout.write_all(&line).await?;
                    }
                }
                Delivery::Poison(err) => consumer.skip(&err)?,
            }
        }
        stdout.flush().await?;
        consumer.commit().await?;
    }
    Ok(())
}

async fn resolve(config: &AppConfig, address: &str) -> anyhow::Result<()> {
    let key = AddressKey::normalize(address);
    if key.is_empty() {
        bail!("address must not be empty");
    }
    let service = GeocodeService::new(config)?;
    match service.resolve(&key).await {
        Resolution::Resolved { coordinates, attempts } => {
            info!(provider = service.provider(), attempts, "address resolved");
            let response = ResolutionResponse {
                address: key.to_string(),
                lat: coordinates.lat,
                lng: coordinates.lng,
            };
            println!("{}", serde_json::to_string(&response)?);
            Ok(())
        }
        Resolution::Failed { error, attempts } => {
            bail!("could not resolve {key} after {attempts} attempt(s): {error}")
        }
    }
}
