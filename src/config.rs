use std::path::PathBuf;
use std::str::FromStr;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::geocode::DEFAULT_GOOGLE_ENDPOINT;
use crate::pending::ExpiryAction;
use crate::reconcile::OrphanPolicy;
use crate::resolver::FlushPolicy;

const DEFAULT_DATA_DIR: &str = ".geo-enrich";
const DEFAULT_DATABASE_FILE: &str = "geo-enrich.db";
const DEFAULT_COUNTRY_HINT: &str = "Germany";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GeocoderKind {
    Google,
    Synthetic,
}

impl FromStr for GeocoderKind {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(GeocoderKind::Google),
            "synthetic" => Ok(GeocoderKind::Synthetic),
            other => Err(AppError::Config(format!("unknown geocoder: {other}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub broker_partitions: u32,
    pub pipeline_workers: usize,
    pub resolver_workers: usize,
    pub poll_timeout_ms: u64,
    pub poll_max_records: usize,
    pub geocoder: GeocoderKind,
    pub google_geocoding_api_key: Option<SecretString>,
    pub google_geocoding_endpoint: String,
    pub geocode_region: Option<String>,
    pub geocode_country_hint: Option<String>,
    pub geocode_language: Option<String>,
    pub geocode_rate_limit_qps: u32,
    pub geocode_timeout_ms: u64,
    pub geocode_max_attempts: u32,
    pub resolver_concurrency: usize,
    pub resolver_flush_policy: FlushPolicy,
    pub orphan_policy: OrphanPolicy,
    pub pending_ttl_secs: u64,
    pub pending_expiry_action: ExpiryAction,
    pub pending_max_rerequests: u32,
    pub expiry_sweep_interval_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub database_file_name: String,
    pub broker_partitions: u32,
    pub pipeline_workers: usize,
    pub resolver_workers: usize,
    pub poll_timeout_ms: u64,
    pub poll_max_records: usize,
    pub geocoder: GeocoderKind,
    pub has_google_geocoding_key: bool,
    pub google_geocoding_endpoint: String,
    pub geocode_region: Option<String>,
    pub geocode_country_hint: Option<String>,
    pub geocode_language: Option<String>,
    pub geocode_rate_limit_qps: u32,
    pub geocode_timeout_ms: u64,
    pub geocode_max_attempts: u32,
    pub resolver_concurrency: usize,
    pub resolver_flush_policy: &'static str,
    pub orphan_policy: &'static str,
    pub pending_ttl_secs: u64,
    pub pending_expiry_action: &'static str,
    pub pending_max_rerequests: u32,
    pub expiry_sweep_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            database_file_name: DEFAULT_DATABASE_FILE.to_string(),
            broker_partitions: 4,
            pipeline_workers: 2,
            resolver_workers: 2,
            poll_timeout_ms: 1_000,
            poll_max_records: 100,
            geocoder: GeocoderKind::Synthetic,
            google_geocoding_api_key: None,
            google_geocoding_endpoint: DEFAULT_GOOGLE_ENDPOINT.to_string(),
            geocode_region: None,
            geocode_country_hint: Some(DEFAULT_COUNTRY_HINT.to_string()),
            geocode_language: None,
            geocode_rate_limit_qps: 10,
            geocode_timeout_ms: 5_000,
            geocode_max_attempts: 4,
            resolver_concurrency: 4,
            resolver_flush_policy: FlushPolicy::PerRecord,
            orphan_policy: OrphanPolicy::Drop,
            pending_ttl_secs: 900,
            pending_expiry_action: ExpiryAction::Rerequest,
            pending_max_rerequests: 3,
            expiry_sweep_interval_secs: 60,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        load_dotenv_if_applicable();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Unset keys
    /// fall back to [`Default`]; malformed numbers do too.
    pub fn from_source<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let google_geocoding_api_key = get("GOOGLE_GEOCODING_API_KEY").map(SecretString::from);
        let geocoder = match get("GEOCODER") {
            Some(value) => value.parse()?,
            None if google_geocoding_api_key.is_some() => GeocoderKind::Google,
            None => defaults.geocoder,
        };

        let config = Self {
            data_dir: get("GEO_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            database_file_name: get("DATABASE_FILE_NAME").unwrap_or(defaults.database_file_name),
            broker_partitions: parse_num(&get, "BROKER_PARTITIONS", defaults.broker_partitions)
                .max(1),
            pipeline_workers: parse_num(&get, "PIPELINE_WORKERS", defaults.pipeline_workers).max(1),
            resolver_workers: parse_num(&get, "RESOLVER_WORKERS", defaults.resolver_workers).max(1),
            poll_timeout_ms: parse_num(&get, "POLL_TIMEOUT_MS", defaults.poll_timeout_ms),
            poll_max_records: parse_num(&get, "POLL_MAX_RECORDS", defaults.poll_max_records).max(1),
            geocoder,
            google_geocoding_api_key,
            google_geocoding_endpoint: get("GOOGLE_GEOCODING_ENDPOINT")
                .unwrap_or(defaults.google_geocoding_endpoint),
            geocode_region: get("GEOCODE_REGION"),
            geocode_country_hint: match lookup("GEOCODE_COUNTRY_HINT") {
                Some(value) if value.trim().is_empty() => None,
                Some(value) => Some(value.trim().to_string()),
                None => defaults.geocode_country_hint,
            },
            geocode_language: get("GEOCODE_LANGUAGE"),
            geocode_rate_limit_qps: parse_num(
                &get,
                "GEOCODE_RATE_LIMIT_QPS",
                defaults.geocode_rate_limit_qps,
            )
            .max(1),
            geocode_timeout_ms: parse_num(&get, "GEOCODE_TIMEOUT_MS", defaults.geocode_timeout_ms),
            geocode_max_attempts: parse_num(
                &get,
                "GEOCODE_MAX_ATTEMPTS",
                defaults.geocode_max_attempts,
            )
            .max(1),
            resolver_concurrency: parse_num(
                &get,
                "RESOLVER_CONCURRENCY",
                defaults.resolver_concurrency,
            )
            .max(1),
            resolver_flush_policy: parse_enum(
                &get,
                "RESOLVER_FLUSH_POLICY",
                defaults.resolver_flush_policy,
            )?,
            orphan_policy: parse_enum(&get, "ORPHAN_POLICY", defaults.orphan_policy)?,
            pending_ttl_secs: parse_num(&get, "PENDING_TTL_SECS", defaults.pending_ttl_secs),
            pending_expiry_action: parse_enum(
                &get,
                "PENDING_EXPIRY_ACTION",
                defaults.pending_expiry_action,
            )?,
            pending_max_rerequests: parse_num(
                &get,
                "PENDING_MAX_REREQUESTS",
                defaults.pending_max_rerequests,
            ),
            expiry_sweep_interval_secs: parse_num(
                &get,
                "EXPIRY_SWEEP_INTERVAL_SECS",
                defaults.expiry_sweep_interval_secs,
            )
            .max(1),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.geocoder == GeocoderKind::Google && self.google_geocoding_api_key.is_none() {
            return Err(AppError::Config(
                "GEOCODER=google requires GOOGLE_GEOCODING_API_KEY".into(),
            ));
        }
        if self.database_file_name.trim().is_empty() {
            return Err(AppError::Config("DATABASE_FILE_NAME must not be empty".into()));
        }
        Ok(())
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            broker_partitions: self.broker_partitions,
            pipeline_workers: self.pipeline_workers,
            resolver_workers: self.resolver_workers,
            poll_timeout_ms: self.poll_timeout_ms,
            poll_max_records: self.poll_max_records,
            geocoder: self.geocoder,
            has_google_geocoding_key: self.google_geocoding_api_key.is_some(),
            google_geocoding_endpoint: self.google_geocoding_endpoint.clone(),
            geocode_region: self.geocode_region.clone(),
            geocode_country_hint: self.geocode_country_hint.clone(),
            geocode_language: self.geocode_language.clone(),
            geocode_rate_limit_qps: self.geocode_rate_limit_qps,
            geocode_timeout_ms: self.geocode_timeout_ms,
            geocode_max_attempts: self.geocode_max_attempts,
            resolver_concurrency: self.resolver_concurrency,
            resolver_flush_policy: self.resolver_flush_policy.as_str(),
            orphan_policy: self.orphan_policy.as_str(),
            pending_ttl_secs: self.pending_ttl_secs,
            pending_expiry_action: self.pending_expiry_action.as_str(),
            pending_max_rerequests: self.pending_max_rerequests,
            expiry_sweep_interval_secs: self.expiry_sweep_interval_secs,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions)
        || env::var("ALLOW_DOTENV")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
}

fn parse_num<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_enum<T, G>(get: &G, key: &str, default: T) -> AppResult<T>
where
    T: FromStr<Err = AppError>,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value.parse(),
        None => Ok(default),
    }
}
