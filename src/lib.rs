pub mod broker;
pub mod cache;
pub mod codec;
pub mod config;
pub mod db;
pub mod enrichment;
pub mod errors;
pub mod geocode;
pub mod model;
pub mod pending;
pub mod pipeline;
pub mod reconcile;
pub mod resolver;
pub mod runtime;
pub mod state;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::broker::{InMemoryBroker, RecordConsumer, RecordProducer};
pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::geocode::{GeocodeService, Geocoder};
pub use crate::model::{AddressKey, EnrichedEvent, RawEvent};
pub use crate::runtime::Deployment;

/// Installs the global subscriber once. Logs go to stderr so stdout stays
/// free for enriched output.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,geo_enrich=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
