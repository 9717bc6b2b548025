//! The run store: query/mutation facade plus its lifecycle
//!
//! A [`RunStore`] owns one record table and one retention sweeper. Both are
//! created by [`RunStore::open`] and torn down together by
//! [`RunStore::shutdown`], sweeper first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::record::{AppendOutcome, ListQuery, Page, Record, StoreStats, truncate_millis};
use crate::retention::{CleanupReport, RetentionPolicy};
use crate::sweeper::{RetentionSweeper, SweepCounters};
use crate::table::RecordTable;

/// Field whose value replaces the whole submission when present
pub const CONTEXT_FIELD: &str = "context";

/// Reduce a submission to the element that gets stored
///
/// An object carrying a `context` field is replaced by that field's value;
/// its other fields are dropped. Anything else is stored as-is.
pub fn unwrap_context(payload: Value) -> Value {
    match payload {
        Value::Object(mut fields) => match fields.remove(CONTEXT_FIELD) {
            Some(context) => context,
            None => Value::Object(fields),
        },
        other => other,
    }
}

/// Stored payload as a list of entries, wrapping a non-array value
fn into_entries(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(entries) => entries,
        other => vec![other],
    }
}

fn validate_run_key(run_key: &str) -> StoreResult<()> {
    if run_key.trim().is_empty() {
        return Err(StoreError::invalid_input("run_key is required"));
    }
    Ok(())
}

fn validate_payload(payload: &Value) -> StoreResult<()> {
    if payload.is_null() {
        return Err(StoreError::invalid_input("payload is required"));
    }
    Ok(())
}

/// Canonical state of a just-written record
///
/// A sweep can remove the row between commit and re-read; the state that was
/// written is returned then.
fn reread_or_written(table: &RecordTable, written: Record) -> StoreResult<Record> {
    match table.get_by_id(&written.id)? {
        Some(record) => Ok(record),
        None => {
            debug!(run_key = %written.run_key, "Record swept before re-read");
            Ok(written)
        }
    }
}

/// Run a blocking storage call off the async runtime
async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::unavailable(format!("storage task failed: {e}")))?
}

/// Append-oriented record store with automatic retention
pub struct RunStore {
    config: StoreConfig,
    /// `None` once the store has been shut down
    table: RwLock<Option<Arc<RecordTable>>>,
    retention: RetentionPolicy,
    counters: Arc<SweepCounters>,
    shutdown_tx: broadcast::Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RunStore {
    /// Open the store
    ///
    /// Creates the database if needed, runs one retention pass to clear any
    /// backlog, then starts the background sweeper.
    #[instrument(skip(config), fields(db_path = %config.db_path.display()))]
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let retention = config.retention_policy()?;

        let path = config.db_path.clone();
        let table = Arc::new(blocking(move || RecordTable::open(path)).await?);

        let counters = Arc::new(SweepCounters::default());
        let initial = {
            let table = Arc::clone(&table);
            blocking(move || retention.enforce(&table)).await?
        };
        counters.record(&initial);

        let (shutdown_tx, _) = broadcast::channel(1);
        let sweeper = RetentionSweeper::spawn(
            Arc::clone(&table),
            retention,
            config.cleanup_interval(),
            Arc::clone(&counters),
            shutdown_tx.subscribe(),
        );

        info!(
            max_records = retention.max_records(),
            max_age_minutes = retention.max_age().num_minutes(),
            initial_deleted = initial.total_deleted,
            "Run store opened"
        );

        Ok(Self {
            config,
            table: RwLock::new(Some(table)),
            retention,
            counters,
            shutdown_tx,
            sweeper: Mutex::new(Some(sweeper)),
            closed: AtomicBool::new(false),
        })
    }

    /// Stop the sweeper, then release the database
    ///
    /// Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(()); // Already shut down
        }

        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.sweeper.lock().await.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Retention sweeper ended abnormally");
        }

        self.table.write().take();
        info!("Run store shut down");
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get the configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Retention totals since open, including the initial pass
    pub fn sweep_counters(&self) -> &SweepCounters {
        &self.counters
    }

    fn table(&self) -> StoreResult<Arc<RecordTable>> {
        self.table
            .read()
            .clone()
            .ok_or_else(|| StoreError::unavailable("store is shut down"))
    }

    /// Append a submission to a run, creating the run on first use
    ///
    /// The lookup and the write share one transaction. The returned record is
    /// re-read after commit; if a sweep removed it in between, the state that
    /// was written is returned instead.
    pub fn create_or_append(&self, run_key: &str, payload: Value) -> StoreResult<AppendOutcome> {
        validate_run_key(run_key)?;
        validate_payload(&payload)?;
        let table = self.table()?;

        let entry = unwrap_context(payload);
        let now = truncate_millis(Utc::now());

        let (written, is_new) = table.write(|txn| match txn.get_by_key(run_key)? {
            None => {
                let record = Record::new(run_key, Value::Array(vec![entry]), now);
                txn.insert(&record)?;
                Ok((record, true))
            }
            Some(existing) => {
                let mut entries = into_entries(existing.payload);
                entries.push(entry);
                let payload = Value::Array(entries);
                txn.update_payload(run_key, &payload, now)?;
                Ok((
                    Record {
                        payload,
                        updated_at: now,
                        ..existing
                    },
                    false,
                ))
            }
        })?;

        let record = reread_or_written(&table, written)?;
        debug!(run_key, is_new, entries = record.entry_count(), "Appended to run");
        Ok(AppendOutcome { record, is_new })
    }

    /// Overwrite a run's payload wholesale
    ///
    /// Returns `None` if the run does not exist.
    pub fn replace(&self, run_key: &str, payload: Value) -> StoreResult<Option<Record>> {
        validate_run_key(run_key)?;
        validate_payload(&payload)?;
        let table = self.table()?;

        let now = truncate_millis(Utc::now());
        let replaced = table.write(|txn| {
            if !txn.update_payload(run_key, &payload, now)? {
                return Ok(None);
            }
            txn.get_by_key(run_key)
        })?;

        if replaced.is_none() {
            debug!(run_key, "Replace target not found");
        }
        Ok(replaced)
    }

    /// Look up a run
    pub fn get(&self, run_key: &str) -> StoreResult<Option<Record>> {
        validate_run_key(run_key)?;
        self.table()?.get_by_key(run_key)
    }

    /// Delete a run; true iff it existed
    pub fn remove(&self, run_key: &str) -> StoreResult<bool> {
        validate_run_key(run_key)?;
        let removed = self.table()?.delete(run_key)?;
        debug!(run_key, removed, "Removed run");
        Ok(removed)
    }

    /// List runs newest first
    pub fn list(&self, query: &ListQuery) -> StoreResult<Page> {
        let limit = self.config.page_limit(query.limit);
        let offset = self.config.page_offset(query.offset);
        let (records, total) = self.table()?.list(&query.filter(), limit, offset)?;

        Ok(Page {
            records,
            total,
            limit,
            offset,
        })
    }

    /// Record count and creation-time bounds, from one snapshot
    pub fn stats(&self) -> StoreResult<StoreStats> {
        self.table()?.read(|view| {
            Ok(StoreStats {
                total_records: view.count()?,
                oldest_record: view.oldest_created()?,
                newest_record: view.newest_created()?,
            })
        })
    }

    /// Run a retention pass immediately
    pub fn run_cleanup_now(&self) -> StoreResult<CleanupReport> {
        let table = self.table()?;
        let report = self.retention.enforce(&table)?;
        self.counters.record(&report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_test_store() -> (RunStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::with_db_path(temp_dir.path().join("store.redb"));
        let store = RunStore::open(config).await.unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_unwrap_context() {
        assert_eq!(
            unwrap_context(json!({"a": 1, "context": {"b": 2}})),
            json!({"b": 2})
        );
        assert_eq!(unwrap_context(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(unwrap_context(json!([1, 2])), json!([1, 2]));
        assert_eq!(unwrap_context(json!("text")), json!("text"));
    }

    #[test]
    fn test_into_entries_wraps_legacy_values() {
        assert_eq!(into_entries(json!([1, 2])), vec![json!(1), json!(2)]);
        assert_eq!(into_entries(json!({"x": 1})), vec![json!({"x": 1})]);
    }

    #[tokio::test]
    async fn test_first_submission_creates_run() {
        let (store, _temp) = open_test_store().await;

        let outcome = store.create_or_append("run-1", json!({"step": 1})).unwrap();
        assert!(outcome.is_new);
        assert_eq!(outcome.record.payload, json!([{"step": 1}]));
        assert_eq!(outcome.record.created_at, outcome.record.updated_at);

        let outcome = store.create_or_append("run-1", json!({"step": 2})).unwrap();
        assert!(!outcome.is_new);
        assert_eq!(outcome.record.payload, json!([{"step": 1}, {"step": 2}]));
        assert!(outcome.record.updated_at >= outcome.record.created_at);

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_wraps_replaced_scalar() {
        let (store, _temp) = open_test_store().await;

        store.create_or_append("run-1", json!({"step": 1})).unwrap();
        store.replace("run-1", json!({"flattened": true})).unwrap();

        let outcome = store.create_or_append("run-1", json!({"step": 2})).unwrap();
        assert_eq!(
            outcome.record.payload,
            json!([{"flattened": true}, {"step": 2}])
        );
    }

    #[tokio::test]
    async fn test_replace_returns_committed_state() {
        let (store, _temp) = open_test_store().await;
        store.create_or_append("run-1", json!({"step": 1})).unwrap();

        let replaced = store.replace("run-1", json!({"done": true})).unwrap().unwrap();
        assert_eq!(replaced.payload, json!({"done": true}));
        assert_eq!(replaced.updated_at.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(store.get("run-1").unwrap().unwrap(), replaced);
    }

    #[test]
    fn test_reread_returns_stored_state() {
        let temp_dir = TempDir::new().unwrap();
        let table = RecordTable::open(temp_dir.path().join("reread.redb")).unwrap();
        let record = Record::new("run-1", json!([1]), Utc::now());
        table.insert(&record).unwrap();

        let written = Record {
            payload: json!([1, 2]),
            ..record.clone()
        };
        assert_eq!(reread_or_written(&table, written).unwrap(), record);
    }

    #[test]
    fn test_reread_falls_back_when_swept() {
        let temp_dir = TempDir::new().unwrap();
        let table = RecordTable::open(temp_dir.path().join("reread.redb")).unwrap();
        let record = Record::new("run-1", json!([1]), Utc::now());
        table.insert(&record).unwrap();

        // A sweep lands between the append's commit and its re-read
        assert!(table.delete("run-1").unwrap());
        let written = Record {
            payload: json!([1, 2]),
            ..record
        };
        assert_eq!(
            reread_or_written(&table, written.clone()).unwrap(),
            written
        );
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_storage() {
        let (store, _temp) = open_test_store().await;

        assert!(matches!(
            store.create_or_append("", json!({"a": 1})),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            store.create_or_append("run-1", Value::Null),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            store.replace("  ", json!(1)),
            Err(StoreError::InvalidInput(_))
        ));
        assert_eq!(store.stats().unwrap().total_records, 0);
    }

    #[tokio::test]
    async fn test_operations_fail_after_shutdown() {
        let (store, _temp) = open_test_store().await;
        store.create_or_append("run-1", json!(1)).unwrap();

        store.shutdown().await.unwrap();
        store.shutdown().await.unwrap();
        assert!(store.is_closed());

        assert!(matches!(
            store.get("run-1"),
            Err(StoreError::StorageUnavailable(_))
        ));
        assert!(matches!(
            store.run_cleanup_now(),
            Err(StoreError::StorageUnavailable(_))
        ));
    }
}
