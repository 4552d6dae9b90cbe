//! Command implementations

pub mod history;
pub mod monitor;
pub mod run;

use crate::config::AgentConfig;
use anyhow::{Context, Result};
use chrono::NaiveTime;
use forest_lib::{
    Classifier, ConflictPolicy, Coordinate, HealthRegistry, HttpImageSource, Orchestrator, Preprocessor,
    SqliteResultStore, StructuredLogger,
};
use std::sync::Arc;

/// Parse a `LAT,LON` pair
pub fn parse_site(value: &str) -> Result<Coordinate, String> {
    let (lat, lon) = value
        .split_once(',')
        .ok_or_else(|| format!("expected LAT,LON, got '{}'", value))?;
    let lat: f64 = lat
        .trim()
        .parse()
        .map_err(|_| format!("invalid latitude '{}'", lat.trim()))?;
    let lon: f64 = lon
        .trim()
        .parse()
        .map_err(|_| format!("invalid longitude '{}'", lon.trim()))?;
    Coordinate::new(lat, lon).map_err(|e| e.to_string())
}

/// Parse a local time of day as `HH:MM` or `HH:MM:SS`
pub fn parse_fire_time(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| format!("expected HH:MM, got '{}'", value))
}

/// Parse a store conflict policy name
pub fn parse_conflict_policy(value: &str) -> Result<ConflictPolicy, String> {
    match value.to_ascii_lowercase().as_str() {
        "replace" => Ok(ConflictPolicy::Replace),
        "reject" => Ok(ConflictPolicy::Reject),
        _ => Err(format!("expected replace or reject, got '{}'", value)),
    }
}

/// Open the configured result store for the configured labels
pub fn open_store(config: &AgentConfig) -> Result<Arc<SqliteResultStore>> {
    let store = SqliteResultStore::open(&config.store, config.classifier.labels.clone())
        .with_context(|| format!("failed to open result store {}", config.store.path.display()))?;
    Ok(Arc::new(store))
}

/// Construct every pipeline component once and wire them together
pub fn build_orchestrator(
    config: &AgentConfig,
    health: HealthRegistry,
    logger: StructuredLogger,
) -> Result<Orchestrator> {
    let source = HttpImageSource::new(config.provider.clone())
        .context("failed to configure image source")?;
    let preprocessor =
        Preprocessor::new(config.preprocess.clone()).context("invalid preprocess settings")?;
    let classifier = Classifier::from_config(&config.classifier, &config.preprocess)
        .context("failed to load classifier")?;
    let store = open_store(config)?;

    Ok(Orchestrator::new(
        Arc::new(source),
        preprocessor,
        Arc::new(classifier),
        store,
    )
    .with_timeouts(config.timeouts)
    .with_health(health)
    .with_logger(logger))
}
