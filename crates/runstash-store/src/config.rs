//! Configuration for the run store

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::retention::{RetentionPolicy, RetentionPolicyBuilder};

/// Configuration for a [`RunStore`](crate::RunStore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Maximum number of records kept
    pub max_records: u64,
    /// Maximum record age, measured from creation
    pub max_age_minutes: u64,
    /// Period of the background retention sweep
    pub cleanup_interval_ms: u64,
    /// Page size used when a list request has none
    pub default_page_size: usize,
    /// Upper bound on any requested page size
    pub max_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/runstash.redb"),
            max_records: 1000,
            max_age_minutes: 60,
            cleanup_interval_ms: 60_000,
            default_page_size: 50,
            max_page_size: 500,
        }
    }
}

impl StoreConfig {
    /// Create a configuration with a custom database path
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    /// Set the maximum record count
    pub fn with_max_records(mut self, max_records: u64) -> Self {
        self.max_records = max_records;
        self
    }

    /// Set the maximum record age
    pub fn with_max_age_minutes(mut self, minutes: u64) -> Self {
        self.max_age_minutes = minutes;
        self
    }

    /// Set the sweep period
    pub fn with_cleanup_interval_ms(mut self, interval_ms: u64) -> Self {
        self.cleanup_interval_ms = interval_ms;
        self
    }

    /// Set default and maximum page sizes
    pub fn with_page_sizes(mut self, default_page_size: usize, max_page_size: usize) -> Self {
        self.default_page_size = default_page_size;
        self.max_page_size = max_page_size;
        self
    }

    /// Check every field, returning the first problem found
    pub fn validate(&self) -> StoreResult<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(StoreError::config("db_path must not be empty"));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(StoreError::config(
                "cleanup_interval_ms must be greater than zero",
            ));
        }
        if self.default_page_size == 0 {
            return Err(StoreError::config(
                "default_page_size must be greater than zero",
            ));
        }
        if self.max_page_size < self.default_page_size {
            return Err(StoreError::config(
                "max_page_size must be at least default_page_size",
            ));
        }
        self.retention_policy().map(|_| ())
    }

    /// Retention caps described by this configuration
    pub fn retention_policy(&self) -> StoreResult<RetentionPolicy> {
        RetentionPolicyBuilder::new()
            .max_records(self.max_records)
            .max_age_minutes(self.max_age_minutes)
            .build()
    }

    /// Sweep period as a duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Resolve a requested page size: default when absent or non-positive,
    /// clamped to the maximum otherwise
    pub fn page_limit(&self, requested: Option<i64>) -> usize {
        match requested {
            Some(limit) if limit > 0 => {
                usize::try_from(limit).map_or(self.max_page_size, |l| l.min(self.max_page_size))
            }
            _ => self.default_page_size,
        }
    }

    /// Resolve a requested offset: zero when absent or negative
    pub fn page_offset(&self, requested: Option<i64>) -> usize {
        requested
            .and_then(|offset| usize::try_from(offset).ok())
            .unwrap_or(0)
    }
}
