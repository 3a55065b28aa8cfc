//! The Metrics Sink: accumulates per-cycle counters/gauges and renders them
//! in Prometheus text exposition format.
//!
//! Grounded on `vaultrs-server::routes::metrics::prometheus_metrics` for the
//! HELP/TYPE line shape and content type, generalized from "recompute on
//! every scrape" to "accumulate on cycle end, read on scrape" because several
//! of these series (the `_total` counters) are monotonic across cycles, not
//! point-in-time queries against live state.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::reconciler::ReconciliationStats;

/// Shared, append-only metrics accumulator. Cheap to clone (wrap in `Arc`
/// at the call site); every field is a plain atomic so reads never block
/// writes.
#[derive(Debug, Default)]
pub struct MetricsSink {
    reconciliations_total: AtomicU64,
    last_reconciliation_timestamp: AtomicI64,
    drift_total: AtomicU64,
    users_managed: AtomicU64,
    roles_managed: AtomicU64,
    errors_total: AtomicU64,
    last_error_timestamp: AtomicI64,
}

impl MetricsSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one cycle's [`ReconciliationStats`] into the running totals.
    /// `users_managed` and `roles_managed` are gauges and are overwritten,
    /// not accumulated.
    pub fn record_cycle(&self, stats: &ReconciliationStats, users_managed: usize, roles_managed: usize) {
        self.reconciliations_total.fetch_add(1, Ordering::Relaxed);
        self.drift_total.fetch_add(stats.drift_count, Ordering::Relaxed);
        self.errors_total.fetch_add(stats.error_count, Ordering::Relaxed);
        self.users_managed
            .store(users_managed as u64, Ordering::Relaxed);
        self.roles_managed
            .store(roles_managed as u64, Ordering::Relaxed);

        let end = stats.end_time.unwrap_or(stats.start_time);
        self.last_reconciliation_timestamp
            .store(end.timestamp(), Ordering::Relaxed);

        if stats.error_count > 0 {
            self.last_error_timestamp.store(end.timestamp(), Ordering::Relaxed);
        }
    }

    /// Renders every series in Prometheus text exposition format, ending in
    /// a trailing newline.
    #[must_use]
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(24);

        push_counter(
            &mut lines,
            "postgres_controller_reconciliations_total",
            "Total number of completed reconciliation cycles.",
            self.reconciliations_total.load(Ordering::Relaxed),
        );
        push_gauge_i64(
            &mut lines,
            "postgres_controller_last_reconciliation_timestamp",
            "Unix timestamp of the end of the last reconciliation cycle.",
            self.last_reconciliation_timestamp.load(Ordering::Relaxed),
        );
        push_counter(
            &mut lines,
            "postgres_controller_drift_total",
            "Cumulative count of creations plus restricted deletions observed across cycles.",
            self.drift_total.load(Ordering::Relaxed),
        );
        push_gauge(
            &mut lines,
            "postgres_controller_users_managed",
            "Number of users in the desired spec as of the last cycle.",
            self.users_managed.load(Ordering::Relaxed),
        );
        push_gauge(
            &mut lines,
            "postgres_controller_roles_managed",
            "Number of live group roles as of the end of the last cycle.",
            self.roles_managed.load(Ordering::Relaxed),
        );
        push_counter(
            &mut lines,
            "postgres_controller_errors_total",
            "Cumulative count of per-item errors observed across cycles.",
            self.errors_total.load(Ordering::Relaxed),
        );
        push_gauge_i64(
            &mut lines,
            "postgres_controller_last_error_timestamp",
            "Unix timestamp of the end of the last cycle that observed any error.",
            self.last_error_timestamp.load(Ordering::Relaxed),
        );

        lines.join("\n") + "\n"
    }
}

fn push_counter(lines: &mut Vec<String>, name: &str, help: &str, value: u64) {
    lines.push(format!("# HELP {name} {help}"));
    lines.push(format!("# TYPE {name} counter"));
    lines.push(format!("{name} {value}"));
}

fn push_gauge(lines: &mut Vec<String>, name: &str, help: &str, value: u64) {
    lines.push(format!("# HELP {name} {help}"));
    lines.push(format!("# TYPE {name} gauge"));
    lines.push(format!("{name} {value}"));
}

fn push_gauge_i64(lines: &mut Vec<String>, name: &str, help: &str, value: i64) {
    lines.push(format!("# HELP {name} {help}"));
    lines.push(format!("# TYPE {name} gauge"));
    lines.push(format!("{name} {value}"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn render_contains_all_documented_series() {
        let sink = MetricsSink::new();
        let text = sink.render();
        for name in [
            "postgres_controller_reconciliations_total",
            "postgres_controller_last_reconciliation_timestamp",
            "postgres_controller_drift_total",
            "postgres_controller_users_managed",
            "postgres_controller_roles_managed",
            "postgres_controller_errors_total",
            "postgres_controller_last_error_timestamp",
        ] {
            assert!(text.contains(name), "missing series {name}");
        }
    }

    #[test]
    fn record_cycle_accumulates_counters_and_overwrites_gauges() {
        let sink = MetricsSink::new();
        let mut stats = ReconciliationStats::start(Utc::now());
        stats.drift_count = 3;
        stats.error_count = 1;
        stats.finish(Utc::now());

        sink.record_cycle(&stats, 5, 2);
        sink.record_cycle(&stats, 7, 2);

        assert_eq!(sink.reconciliations_total.load(Ordering::Relaxed), 2);
        assert_eq!(sink.drift_total.load(Ordering::Relaxed), 6);
        assert_eq!(sink.errors_total.load(Ordering::Relaxed), 2);
        assert_eq!(sink.users_managed.load(Ordering::Relaxed), 7);
    }
}
