//! Background retention sweeper
//!
//! Runs a retention pass on a fixed interval until the shutdown channel
//! fires. Passes run on the blocking pool since redb calls are synchronous.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument};

use crate::retention::{CleanupReport, RetentionPolicy};
use crate::table::RecordTable;

/// Running totals across sweeps
#[derive(Debug, Default)]
pub struct SweepCounters {
    sweeps: AtomicU64,
    deleted: AtomicU64,
    failures: AtomicU64,
}

impl SweepCounters {
    /// Number of completed passes
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Records removed across all passes
    pub fn deleted(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Passes that returned an error
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, report: &CleanupReport) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.deleted.fetch_add(report.total_deleted, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Periodic retention task
pub struct RetentionSweeper {
    table: Arc<RecordTable>,
    policy: RetentionPolicy,
    interval: Duration,
    counters: Arc<SweepCounters>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl RetentionSweeper {
    pub fn new(
        table: Arc<RecordTable>,
        policy: RetentionPolicy,
        interval: Duration,
        counters: Arc<SweepCounters>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            table,
            policy,
            interval,
            counters,
            shutdown_rx,
        }
    }

    /// Spawn the sweeper as a background task
    pub fn spawn(
        table: Arc<RecordTable>,
        policy: RetentionPolicy,
        interval: Duration,
        counters: Arc<SweepCounters>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let sweeper = Self::new(table, policy, interval, counters, shutdown_rx);
        tokio::spawn(async move {
            sweeper.run().await;
        })
    }

    /// Run the sweep loop
    async fn run(mut self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Retention sweeper started");

        // The store runs its own pass at open, so the first tick waits a full period.
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Retention sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn sweep(&self) {
        let table = Arc::clone(&self.table);
        let policy = self.policy;

        match tokio::task::spawn_blocking(move || policy.enforce(&table)).await {
            Ok(Ok(report)) => {
                self.counters.record(&report);
                debug!(sweeps = self.counters.sweeps(), "Retention sweep complete");
            }
            Ok(Err(e)) => {
                self.counters.record_failure();
                error!(error = %e, "Retention sweep failed");
            }
            Err(e) => {
                self.counters.record_failure();
                error!(error = %e, "Retention sweep task panicked");
            }
        }
    }
}
