//! Prometheus metrics for the scheduler fleet
//!
//! Exposes firing activity, reconciliation throughput, and leadership so a
//! fleet dashboard can tell which replica is firing and whether the job
//! tables agree.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Scheduler metrics registry
///
/// Thread-safe container for all metrics; clone is cheap.
#[derive(Clone)]
pub struct SchedulerMetrics {
    registry: Registry,
    /// Fire decisions by result (success, error, skipped)
    pub fires_total: IntCounterVec,
    /// Applied change events by operation (insert, update, delete)
    pub reconcile_events_total: IntCounterVec,
    /// Currently installed job entries
    pub jobs_installed: IntGauge,
    /// 1 while this replica holds the lease
    pub leader: IntGauge,
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let fires_total = IntCounterVec::new(
            Opts::new("vuoro_fires_total", "Schedule fire decisions by result"),
            &["result"],
        )?;
        registry.register(Box::new(fires_total.clone()))?;

        let reconcile_events_total = IntCounterVec::new(
            Opts::new(
                "vuoro_reconcile_events_total",
                "Schedule change events applied, by operation",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(reconcile_events_total.clone()))?;

        let jobs_installed = IntGauge::new(
            "vuoro_jobs_installed",
            "Number of schedules installed in the job table",
        )?;
        registry.register(Box::new(jobs_installed.clone()))?;

        let leader = IntGauge::new(
            "vuoro_leader",
            "Whether this replica currently holds the lease",
        )?;
        registry.register(Box::new(leader.clone()))?;

        Ok(Self {
            registry,
            fires_total,
            reconcile_events_total,
            jobs_installed,
            leader,
        })
    }

    /// Count a fire decision: "success", "error", or "skipped"
    pub fn record_fire(&self, result: &str) {
        self.fires_total.with_label_values(&[result]).inc();
    }

    /// Count an applied change event by operation
    pub fn record_reconcile(&self, operation: &str) {
        self.reconcile_events_total
            .with_label_values(&[operation])
            .inc();
    }

    /// Track the size of the job table
    pub fn set_jobs_installed(&self, count: i64) {
        self.jobs_installed.set(count);
    }

    /// Track leadership transitions
    pub fn set_leader(&self, is_leader: bool) {
        self.leader.set(i64::from(is_leader));
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not valid UTF-8: {e}")))
    }
}

/// Shared metrics handle
pub type SharedMetrics = Arc<SchedulerMetrics>;

/// Create a new shared metrics instance
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(SchedulerMetrics::new()?))
}
