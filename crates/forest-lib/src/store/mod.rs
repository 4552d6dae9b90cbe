//! Durable classification results
//!
//! One record per (date, site). Re-running a day for the same site either
//! replaces the record in a single atomic upsert or is rejected with
//! [`StoreError::DuplicateKey`], depending on [`ConflictPolicy`]. The store
//! never holds two rows for one key.

mod schema;
mod sqlite;

pub use schema::{probability_column, SCHEMA_VERSION, TABLE_NAME};
pub use sqlite::SqliteResultStore;

use crate::error::StoreError;
use crate::models::{Coordinate, StoredRecord};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use async_trait::async_trait;

/// What happens when a record for the same key already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Overwrite the existing record atomically; last write wins
    #[default]
    Replace,
    /// Fail with `DuplicateKey`
    Reject,
}

/// Effect of a successful save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Replaced,
}

/// Store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub conflict_policy: ConflictPolicy,
    /// How long a writer waits for another process's lock
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("forest_health.db"),
            conflict_policy: ConflictPolicy::Replace,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Trait for result store implementations
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist a record under its (date, coordinate) key
    async fn save(&self, record: &StoredRecord) -> Result<SaveOutcome, StoreError>;

    /// Record for one site and day
    async fn read(
        &self,
        date: NaiveDate,
        coordinate: Coordinate,
    ) -> Result<Option<StoredRecord>, StoreError>;

    /// Records for a site ordered by date, optionally bounded (inclusive)
    async fn history(
        &self,
        coordinate: Coordinate,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    fn conflict_policy(&self) -> ConflictPolicy;
}
