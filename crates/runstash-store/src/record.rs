//! Record types
//!
//! [`Record`] is what callers see. [`StoredRow`] is its on-disk form: one
//! postcard-encoded row per run key, with the payload kept as JSON text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// A run record: every payload submitted under one run key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Process-assigned identifier, fixed at creation
    pub id: Uuid,
    /// Caller-supplied grouping key, unique across the store
    pub run_key: String,
    /// Stored payload; an array of submissions once appended to
    pub payload: Value,
    /// Creation time (millisecond precision)
    pub created_at: DateTime<Utc>,
    /// Time of the last append or replace (millisecond precision)
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Create a new record with a fresh id, created and updated at `now`
    pub fn new(run_key: impl Into<String>, payload: Value, now: DateTime<Utc>) -> Self {
        let now = truncate_millis(now);
        Self {
            id: Uuid::new_v4(),
            run_key: run_key.into(),
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Override the creation time (and the update time with it)
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        let created_at = truncate_millis(created_at);
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Number of submissions held in the payload
    ///
    /// A payload that is not an array counts as a single submission.
    pub fn entry_count(&self) -> usize {
        match &self.payload {
            Value::Array(entries) => entries.len(),
            _ => 1,
        }
    }
}

/// On-disk row layout: `{id, run_key, payload, created_at, updated_at}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredRow {
    pub id: String,
    pub run_key: String,
    /// Payload as JSON text
    pub payload: String,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis
    pub updated_at: i64,
}

impl StoredRow {
    pub fn from_record(record: &Record) -> StoreResult<Self> {
        Ok(Self {
            id: record.id.to_string(),
            run_key: record.run_key.clone(),
            payload: serde_json::to_string(&record.payload)?,
            created_at: record.created_at.timestamp_millis(),
            updated_at: record.updated_at.timestamp_millis(),
        })
    }

    pub fn into_record(self) -> StoreResult<Record> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::deserialization(format!("bad record id {}: {e}", self.id)))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| StoreError::deserialization(e.to_string()))?;
        Ok(Record {
            id,
            run_key: self.run_key,
            payload,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| StoreError::serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Convert Unix millis back into a UTC timestamp
pub(crate) fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::deserialization(format!("timestamp out of range: {millis}")))
}

/// Drop sub-millisecond precision so in-memory values match stored ones
pub(crate) fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Conjunctive filter over stored records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Exact run key match
    pub run_key: Option<String>,
    /// Inclusive lower bound on `created_at`
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub end: Option<DateTime<Utc>>,
}

impl ListFilter {
    /// Whether a record passes every bound set on this filter
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(run_key) = &self.run_key
            && run_key != &record.run_key
        {
            return false;
        }
        if let Some(start) = self.start
            && record.created_at < start
        {
            return false;
        }
        if let Some(end) = self.end
            && record.created_at > end
        {
            return false;
        }
        true
    }
}

/// A caller's list request, before defaults and clamping
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub run_key: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Page size; absent or non-positive means the configured default
    pub limit: Option<i64>,
    /// Rows to skip; absent or negative means zero
    pub offset: Option<i64>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_key(mut self, run_key: impl Into<String>) -> Self {
        self.run_key = Some(run_key.into());
        self
    }

    pub fn with_range(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub(crate) fn filter(&self) -> ListFilter {
        ListFilter {
            run_key: self.run_key.clone(),
            start: self.start,
            end: self.end,
        }
    }
}

/// One page of records, newest first
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub records: Vec<Record>,
    /// Matching records across all pages
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

/// Result of a create-or-append
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendOutcome {
    /// The record as stored after the write
    pub record: Record,
    /// True when this submission created the record
    pub is_new: bool,
}

/// Store-wide counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_records: u64,
    pub oldest_record: Option<DateTime<Utc>>,
    pub newest_record: Option<DateTime<Utc>>,
}
