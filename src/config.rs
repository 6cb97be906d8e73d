//! TOML configuration.
//!
//! The configuration is parsed and validated once at startup by
//! [`load_config`] and then passed by reference into every component.
//! Nothing in the pipeline reads the environment or global state after that,
//! with the single exception of the imagery access token, which is resolved
//! from `MAPILLARY_API_KEY` inside [`load_config`] when the file omits it.
//!
//! ```toml
//! [db]
//! path = "./data/hazards.sqlite"
//!
//! [area]
//! lat_min = 13.035
//! lon_min = 80.225
//! lat_max = 13.065
//! lon_max = 80.255
//!
//! [roads]
//! overpass_url = "https://overpass-api.de/api/interpreter"
//!
//! [clustering]
//! eps_meters = 15.0
//! min_samples = 2
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::RetryPolicy;
use crate::models::BoundingBox;

/// Environment variable consulted when `[imagery].access_token` is absent.
pub const ACCESS_TOKEN_ENV: &str = "MAPILLARY_API_KEY";

/// Upper bound for `ingest.default_lookback_days` (about a century).
pub const MAX_LOOKBACK_DAYS: i64 = 36_500;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub area: BoundingBox,
    #[serde(default)]
    pub http: HttpConfig,
    pub roads: RoadsConfig,
    #[serde(default)]
    pub imagery: ImageryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Retry/backoff/timeout constants shared by every outbound request.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Attempt budget for imagery page fetches.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    2000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoadsConfig {
    pub overpass_url: String,
    #[serde(default = "default_road_attempts")]
    pub max_attempts: u32,
    /// Server-side timeout embedded in the Overpass query.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_highway_classes")]
    pub highway_classes: Vec<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_road_attempts() -> u32 {
    3
}
fn default_query_timeout_secs() -> u64 {
    90
}
fn default_highway_classes() -> Vec<String> {
    [
        "motorway",
        "trunk",
        "primary",
        "secondary",
        "tertiary",
        "residential",
        "service",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_chunk_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageryConfig {
    #[serde(default = "default_imagery_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_detection_attempts")]
    pub detection_attempts: u32,
    #[serde(default = "default_detection_concurrency")]
    pub detection_concurrency: usize,
    #[serde(default = "default_detection_batch_delay_ms")]
    pub detection_batch_delay_ms: u64,
}

impl Default for ImageryConfig {
    fn default() -> Self {
        Self {
            base_url: default_imagery_base_url(),
            access_token: None,
            page_limit: default_page_limit(),
            page_delay_ms: default_page_delay_ms(),
            detection_attempts: default_detection_attempts(),
            detection_concurrency: default_detection_concurrency(),
            detection_batch_delay_ms: default_detection_batch_delay_ms(),
        }
    }
}

impl ImageryConfig {
    /// The access token. Present after [`load_config`] has validated the file.
    pub fn token(&self) -> &str {
        self.access_token.as_deref().unwrap_or_default()
    }
}

fn default_imagery_base_url() -> String {
    "https://graph.mapillary.com".to_string()
}
fn default_page_limit() -> u32 {
    2000
}
fn default_page_delay_ms() -> u64 {
    1000
}
fn default_detection_attempts() -> u32 {
    2
}
fn default_detection_concurrency() -> usize {
    20
}
fn default_detection_batch_delay_ms() -> u64 {
    500
}

/// Batch sizes and transient-error retries for store writes.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_store_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_store_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_attempts: default_store_attempts(),
            retry_base_delay_ms: default_store_retry_base_delay_ms(),
        }
    }
}

fn default_store_attempts() -> u32 {
    3
}
fn default_store_retry_base_delay_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_eps_meters")]
    pub eps_meters: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            eps_meters: default_eps_meters(),
            min_samples: default_min_samples(),
        }
    }
}

fn default_eps_meters() -> f64 {
    15.0
}
fn default_min_samples() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Forced backfill start. When set, the stored checkpoint is ignored and
    /// never overwritten.
    #[serde(default)]
    pub force_start_date: Option<DateTime<Utc>>,
    /// Lookback used when no checkpoint exists yet.
    #[serde(default = "default_lookback_days")]
    pub default_lookback_days: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            force_start_date: None,
            default_lookback_days: default_lookback_days(),
        }
    }
}

fn default_lookback_days() -> i64 {
    180
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.imagery.access_token.is_none() {
        config.imagery.access_token = std::env::var(ACCESS_TOKEN_ENV).ok();
    }

    validate(&config)?;
    Ok(config)
}

/// Check every invariant the pipeline relies on.
pub fn validate(config: &Config) -> Result<()> {
    config.area.validate().context("invalid [area]")?;

    if config.http.max_attempts == 0 {
        bail!("http.max_attempts must be >= 1");
    }
    if config.http.base_delay_ms > config.http.max_delay_ms {
        bail!("http.base_delay_ms must not exceed http.max_delay_ms");
    }
    if config.http.timeout_secs == 0 {
        bail!("http.timeout_secs must be > 0");
    }

    if config.roads.overpass_url.trim().is_empty() {
        bail!("roads.overpass_url must not be empty");
    }
    if config.roads.max_attempts == 0 {
        bail!("roads.max_attempts must be >= 1");
    }
    if config.roads.highway_classes.is_empty() {
        bail!("roads.highway_classes must list at least one class");
    }
    if let Some(bad) = config
        .roads
        .highway_classes
        .iter()
        .find(|c| c.is_empty() || !c.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'))
    {
        bail!("roads.highway_classes contains an invalid class: '{}'", bad);
    }
    if config.roads.chunk_size == 0 {
        bail!("roads.chunk_size must be > 0");
    }

    match config.imagery.access_token.as_deref() {
        Some(token) if !token.trim().is_empty() => {}
        _ => bail!(
            "imagery.access_token is not set and {} is missing from the environment",
            ACCESS_TOKEN_ENV
        ),
    }
    if config.imagery.page_limit == 0 {
        bail!("imagery.page_limit must be > 0");
    }
    if config.imagery.detection_attempts == 0 {
        bail!("imagery.detection_attempts must be >= 1");
    }
    if config.imagery.detection_concurrency == 0 {
        bail!("imagery.detection_concurrency must be > 0");
    }

    if config.store.chunk_size == 0 {
        bail!("store.chunk_size must be > 0");
    }
    if config.store.max_attempts == 0 {
        bail!("store.max_attempts must be >= 1");
    }

    if !(config.clustering.eps_meters.is_finite() && config.clustering.eps_meters > 0.0) {
        bail!("clustering.eps_meters must be a positive number");
    }
    if config.clustering.min_samples == 0 {
        bail!("clustering.min_samples must be >= 1");
    }

    if config.ingest.default_lookback_days <= 0 {
        bail!("ingest.default_lookback_days must be > 0");
    }
    if config.ingest.default_lookback_days > MAX_LOOKBACK_DAYS {
        bail!(
            "ingest.default_lookback_days must be <= {}",
            MAX_LOOKBACK_DAYS
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/hazards.sqlite"

[area]
lat_min = 13.035
lon_min = 80.225
lat_max = 13.065
lon_max = 80.255

[roads]
overpass_url = "https://overpass.example/api/interpreter"

[imagery]
access_token = "MLY|test"
"#;

    fn parse(s: &str) -> Config {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn defaults_match_provider_limits() {
        let cfg = parse(MINIMAL);
        validate(&cfg).unwrap();

        assert_eq!(cfg.http.max_attempts, 5);
        assert_eq!(cfg.http.timeout_secs, 120);
        assert_eq!(cfg.roads.max_attempts, 3);
        assert_eq!(cfg.roads.chunk_size, 500);
        assert_eq!(cfg.roads.highway_classes.len(), 7);
        assert_eq!(cfg.imagery.page_limit, 2000);
        assert_eq!(cfg.imagery.detection_attempts, 2);
        assert_eq!(cfg.imagery.detection_concurrency, 20);
        assert_eq!(cfg.imagery.detection_batch_delay_ms, 500);
        assert_eq!(cfg.store.chunk_size, 500);
        assert_eq!(cfg.clustering.min_samples, 2);
        assert!(cfg.ingest.force_start_date.is_none());
    }

    #[test]
    fn force_start_date_parses_rfc3339() {
        let cfg = parse(&format!(
            "{}\n[ingest]\nforce_start_date = \"2024-01-01T00:00:00Z\"\n",
            MINIMAL
        ));
        let forced = cfg.ingest.force_start_date.unwrap();
        assert_eq!(forced.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn inverted_area_is_rejected() {
        let cfg = parse(&MINIMAL.replace("lat_max = 13.065", "lat_max = 13.0"));
        let err = validate(&cfg).unwrap_err();
        assert!(format!("{:#}", err).contains("lat_min"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = parse(&MINIMAL.replace(
            "access_token = \"MLY|test\"",
            "access_token = \"MLY|test\"\ndetection_concurrency = 0",
        ));
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn lookback_is_bounded() {
        let within = parse(&format!("{}\n[ingest]\ndefault_lookback_days = 36500\n", MINIMAL));
        validate(&within).unwrap();

        let huge = parse(&format!(
            "{}\n[ingest]\ndefault_lookback_days = 9223372036854775807\n",
            MINIMAL
        ));
        let err = validate(&huge).unwrap_err();
        assert!(err.to_string().contains("default_lookback_days"));
    }

    #[test]
    fn retry_policy_carries_http_timings() {
        let cfg = parse(&format!(
            "{}\n[http]\nbase_delay_ms = 10\nmax_delay_ms = 40\ntimeout_secs = 7\n",
            MINIMAL
        ));
        let policy = cfg.http.retry_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_millis(40));
        assert_eq!(policy.timeout, Duration::from_secs(7));
    }

    #[test]
    fn highway_class_must_be_plain_identifier() {
        let cfg = parse(&MINIMAL.replace(
            "overpass_url = \"https://overpass.example/api/interpreter\"",
            "overpass_url = \"https://overpass.example/api/interpreter\"\nhighway_classes = [\"primary)|.*\"]",
        ));
        assert!(validate(&cfg).is_err());
    }
}
