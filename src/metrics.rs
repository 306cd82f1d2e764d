//! Metrics and observability for docshift.
//!
//! [`Metrics`] keeps in-process atomic totals for the run report; every
//! recording also goes to the `metrics` facade so an installed exporter sees
//! the same numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collector for backup runs.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Entity backups attempted
    pub backups_total: AtomicU64,
    /// Entity backups completed
    pub backups_success: AtomicU64,
    /// Entity backups aborted by a fatal error
    pub backups_failed: AtomicU64,
    /// Documents read from the source
    pub documents_read: AtomicU64,
    /// Rows inserted
    pub rows_written: AtomicU64,
    /// Rows skipped as already migrated
    pub rows_skipped: AtomicU64,
    /// Rows rejected (coercion, missing value, constraint)
    pub rows_failed: AtomicU64,
    /// Total backup duration in milliseconds
    pub backup_duration_ms: AtomicU64,
    /// Migrations applied
    pub migrations_applied: AtomicU64,
    /// Rows written by repair passes
    pub repair_rows: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one document's outcome.
    pub fn record_row(&self, entity: &str, outcome: RowMetric) {
        self.documents_read.fetch_add(1, Ordering::Relaxed);
        let (counter, label) = match outcome {
            RowMetric::Written => (&self.rows_written, "written"),
            RowMetric::Skipped => (&self.rows_skipped, "skipped"),
            RowMetric::Failed => (&self.rows_failed, "failed"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("docshift_rows_total", "entity" => entity.to_string(), "outcome" => label)
            .increment(1);
    }

    /// Record a finished entity backup.
    pub fn record_backup(&self, entity: &str, success: bool, duration_ms: u64) {
        self.backups_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.backups_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.backups_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.backup_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        metrics::counter!(
            "docshift_backups_total",
            "entity" => entity.to_string(),
            "status" => if success { "success" } else { "failed" }
        )
        .increment(1);
    }

    /// Record an applied migration.
    pub fn record_migration(&self) {
        self.migrations_applied.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("docshift_migrations_applied_total").increment(1);
    }

    /// Record rows written by a repair pass.
    pub fn record_repair_rows(&self, repair: &str, rows: u64) {
        self.repair_rows.fetch_add(rows, Ordering::Relaxed);
        metrics::counter!("docshift_repair_rows_total", "repair" => repair.to_string())
            .increment(rows);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backups_total: self.backups_total.load(Ordering::Relaxed),
            backups_success: self.backups_success.load(Ordering::Relaxed),
            backups_failed: self.backups_failed.load(Ordering::Relaxed),
            documents_read: self.documents_read.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            backup_duration_ms: self.backup_duration_ms.load(Ordering::Relaxed),
            migrations_applied: self.migrations_applied.load(Ordering::Relaxed),
            repair_rows: self.repair_rows.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one document, for [`Metrics::record_row`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowMetric {
    /// Inserted
    Written,
    /// Already migrated
    Skipped,
    /// Rejected
    Failed,
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Entity backups attempted
    pub backups_total: u64,
    /// Entity backups completed
    pub backups_success: u64,
    /// Entity backups aborted
    pub backups_failed: u64,
    /// Documents read
    pub documents_read: u64,
    /// Rows inserted
    pub rows_written: u64,
    /// Rows skipped
    pub rows_skipped: u64,
    /// Rows rejected
    pub rows_failed: u64,
    /// Total backup duration in milliseconds
    pub backup_duration_ms: u64,
    /// Migrations applied
    pub migrations_applied: u64,
    /// Repair rows written
    pub repair_rows: u64,
}

impl MetricsSnapshot {
    /// Fraction of entity backups that completed.
    pub fn success_rate(&self) -> f64 {
        if self.backups_total == 0 {
            0.0
        } else {
            self.backups_success as f64 / self.backups_total as f64
        }
    }

    /// Calculate rows written per second.
    pub fn rows_per_second(&self) -> f64 {
        if self.backup_duration_ms == 0 {
            0.0
        } else {
            (self.rows_written as f64 * 1000.0) / self.backup_duration_ms as f64
        }
    }
}

/// Wall-clock timer for one entity backup or a whole run.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    operation: String,
}

impl Timer {
    /// Start timing `operation`.
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.into(),
        }
    }

    /// Milliseconds since the timer started.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop, emit a `docshift_duration_ms` histogram sample, and return the
    /// elapsed milliseconds.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        metrics::histogram!("docshift_duration_ms", "operation" => self.operation.clone())
            .record(elapsed as f64);
        tracing::debug!(operation = %self.operation, elapsed_ms = elapsed, "timer stopped");
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_row("users", RowMetric::Written);
        metrics.record_row("users", RowMetric::Written);
        metrics.record_row("users", RowMetric::Skipped);
        metrics.record_row("users", RowMetric::Failed);
        metrics.record_backup("users", true, 1000);
        metrics.record_backup("cv", false, 500);
        metrics.record_migration();
        metrics.record_repair_rows("details", 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_read, 4);
        assert_eq!(snapshot.rows_written, 2);
        assert_eq!(snapshot.rows_skipped, 1);
        assert_eq!(snapshot.rows_failed, 1);
        assert_eq!(snapshot.backups_total, 2);
        assert_eq!(snapshot.backups_success, 1);
        assert_eq!(snapshot.backups_failed, 1);
        assert_eq!(snapshot.migrations_applied, 1);
        assert_eq!(snapshot.repair_rows, 3);
    }

    #[test]
    fn test_metrics_calculations() {
        let snapshot = MetricsSnapshot {
            backups_total: 10,
            backups_success: 8,
            backups_failed: 2,
            documents_read: 1100,
            rows_written: 1000,
            rows_skipped: 50,
            rows_failed: 50,
            backup_duration_ms: 5000,
            migrations_applied: 2,
            repair_rows: 0,
        };

        assert!((snapshot.success_rate() - 0.8).abs() < 0.001);
        assert!((snapshot.rows_per_second() - 200.0).abs() < 0.001);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("backup:users");
        let early = timer.elapsed_ms();
        assert!(timer.stop() >= early);
    }

    #[test]
    fn test_rates_on_empty_snapshot() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.success_rate(), 0.0);
        assert_eq!(snapshot.rows_per_second(), 0.0);
    }
}
