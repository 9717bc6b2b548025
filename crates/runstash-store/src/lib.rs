//! # Runstash Store
//!
//! A small record store for run events, backed by redb.
//!
//! Callers append structured payloads under a run key; every run keeps its
//! submissions as an ordered array. Records expire automatically through a
//! retention policy that caps both record age and record count.
//!
//! ## Features
//!
//! - **RecordTable**: durable storage keyed by id and run key, indexed by creation time
//! - **RetentionPolicy**: age cutoff followed by oldest-first count trimming
//! - **RetentionSweeper**: background task applying the policy on a fixed interval
//! - **RunStore**: create-or-append, replace, lookup, paginated listing, stats
//!
//! ## Example
//!
//! ```rust,ignore
//! use runstash_store::{ListQuery, RunStore, StoreConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), runstash_store::StoreError> {
//!     let store = RunStore::open(StoreConfig::with_db_path("./data/runs.redb")).await?;
//!
//!     // First submission creates the run, later ones append to it
//!     store.create_or_append("build-42", json!({"stage": "compile"}))?;
//!     let outcome = store.create_or_append("build-42", json!({"stage": "test"}))?;
//!     assert_eq!(outcome.record.entry_count(), 2);
//!
//!     let page = store.list(&ListQuery::new().with_limit(10))?;
//!     println!("{} runs stored", page.total);
//!
//!     store.shutdown().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod record;
pub mod retention;
pub mod store;
pub mod sweeper;
pub mod table;

// Re-exports
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use record::{AppendOutcome, ListFilter, ListQuery, Page, Record, StoreStats};
pub use retention::{CleanupReport, RetentionPolicy, RetentionPolicyBuilder};
pub use store::{CONTEXT_FIELD, RunStore, unwrap_context};
pub use sweeper::{RetentionSweeper, SweepCounters};
pub use table::{RecordReader, RecordTable, RecordTxn, RecordView};
