//! Retention policy
//!
//! Two independent caps on the record table: a maximum age and a maximum
//! record count. A pass applies the age cap first, then trims whatever is
//! still over the count cap, oldest first. Both steps share one write
//! transaction, so a pass is atomic with respect to facade writes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::table::RecordTable;

/// Outcome of one retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Records removed for being older than the age cap
    pub deleted_by_age: u64,
    /// Records removed to get back under the count cap
    pub deleted_by_count: u64,
    pub total_deleted: u64,
    /// Records left after the pass
    pub remaining_records: u64,
}

impl CleanupReport {
    /// Whether the pass removed anything
    pub fn is_noop(&self) -> bool {
        self.total_deleted == 0
    }
}

/// Age and count caps for the record table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_records: u64,
    max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_records: 1000,
            max_age: Duration::minutes(60),
        }
    }
}

impl RetentionPolicy {
    /// Create a policy with the given caps
    pub fn new(max_records: u64, max_age_minutes: u64) -> StoreResult<Self> {
        if max_records == 0 {
            return Err(StoreError::config("max_records must be greater than zero"));
        }
        if max_age_minutes == 0 {
            return Err(StoreError::config("max_age_minutes must be greater than zero"));
        }
        let minutes = i64::try_from(max_age_minutes)
            .map_err(|_| StoreError::config("max_age_minutes is out of range"))?;
        let max_age = Duration::try_minutes(minutes)
            .ok_or_else(|| StoreError::config("max_age_minutes is out of range"))?;

        Ok(Self {
            max_records,
            max_age,
        })
    }

    /// Get the maximum record count
    pub fn max_records(&self) -> u64 {
        self.max_records
    }

    /// Get the maximum record age
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Records created before this instant are over the age cap
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// How many records to trim from `remaining` to satisfy the count cap
    pub fn overflow(&self, remaining: u64) -> u64 {
        remaining.saturating_sub(self.max_records)
    }

    /// Run a retention pass against the current time
    pub fn enforce(&self, table: &RecordTable) -> StoreResult<CleanupReport> {
        self.enforce_at(table, Utc::now())
    }

    /// Run a retention pass as if the current time were `now`
    pub fn enforce_at(&self, table: &RecordTable, now: DateTime<Utc>) -> StoreResult<CleanupReport> {
        let cutoff = self.cutoff(now);

        let report = table.write(|txn| {
            let deleted_by_age = txn.delete_older_than(cutoff)?;
            let remaining = txn.count()?;
            let deleted_by_count = match self.overflow(remaining) {
                0 => 0,
                excess => txn.delete_oldest(excess)?,
            };

            Ok(CleanupReport {
                deleted_by_age,
                deleted_by_count,
                total_deleted: deleted_by_age + deleted_by_count,
                remaining_records: remaining - deleted_by_count,
            })
        })?;

        if report.is_noop() {
            debug!(remaining = report.remaining_records, "Retention pass removed nothing");
        } else {
            info!(
                deleted_by_age = report.deleted_by_age,
                deleted_by_count = report.deleted_by_count,
                total_deleted = report.total_deleted,
                remaining = report.remaining_records,
                "Retention pass removed records"
            );
        }

        Ok(report)
    }
}

/// Builder for RetentionPolicy
#[derive(Debug, Default)]
pub struct RetentionPolicyBuilder {
    max_records: Option<u64>,
    max_age_minutes: Option<u64>,
}

impl RetentionPolicyBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum record count
    pub fn max_records(mut self, max: u64) -> Self {
        self.max_records = Some(max);
        self
    }

    /// Set the maximum record age in minutes
    pub fn max_age_minutes(mut self, minutes: u64) -> Self {
        self.max_age_minutes = Some(minutes);
        self
    }

    /// Build the policy, falling back to defaults for unset caps
    pub fn build(self) -> StoreResult<RetentionPolicy> {
        let defaults = RetentionPolicy::default();
        RetentionPolicy::new(
            self.max_records.unwrap_or(defaults.max_records),
            self.max_age_minutes
                .unwrap_or(defaults.max_age.num_minutes() as u64),
        )
    }
}
