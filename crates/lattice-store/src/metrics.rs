//! Prometheus metrics export.
//!
//! Available behind the `metrics` cargo feature:
//!
//! ```toml
//! [dependencies]
//! lattice-store = { version = "*", features = ["metrics"] }
//! ```
//!
//! # Metrics Exported
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `lattice_query_latency_seconds` | Histogram | Search latency distribution |
//! | `lattice_query_total` | Counter | Total searches served |
//! | `lattice_vectors_total` | Gauge | Live vectors held by this node |
//! | `lattice_vectors_local` | Gauge | Live vectors owned under the ring |
//! | `lattice_transfer_tasks_total` | CounterVec | Task transitions by state |
//! | `lattice_rebalance_operations_total` | Counter | Rebalances triggered |
//! | `lattice_rebalance_active` | Gauge | Rebalances not yet terminal |

use std::time::Duration;

#[cfg(feature = "metrics")]
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Error type for metrics operations.
#[derive(Debug)]
pub struct MetricsError(String);

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MetricsError: {}", self.0)
    }
}

impl std::error::Error for MetricsError {}

#[cfg(feature = "metrics")]
impl From<prometheus::Error> for MetricsError {
    fn from(e: prometheus::Error) -> Self {
        MetricsError(e.to_string())
    }
}

/// Prometheus registry for a LatticeDB node.
#[cfg(feature = "metrics")]
pub struct MetricsRegistry {
    registry: Registry,
    query_latency: Histogram,
    query_count: IntCounter,
    vectors_total: IntGauge,
    vectors_local: IntGauge,
    transfer_tasks: IntCounterVec,
    rebalance_operations: IntCounter,
    rebalance_active: IntGauge,
}

#[cfg(feature = "metrics")]
impl MetricsRegistry {
    /// Creates and registers all collectors.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let query_latency = Histogram::with_opts(
            HistogramOpts::new(
                "lattice_query_latency_seconds",
                "Search latency distribution",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(query_latency.clone()))?;

        let query_count = IntCounter::with_opts(Opts::new(
            "lattice_query_total",
            "Total searches served",
        ))?;
        registry.register(Box::new(query_count.clone()))?;

        let vectors_total = IntGauge::with_opts(Opts::new(
            "lattice_vectors_total",
            "Live vectors held by this node",
        ))?;
        registry.register(Box::new(vectors_total.clone()))?;

        let vectors_local = IntGauge::with_opts(Opts::new(
            "lattice_vectors_local",
            "Live vectors owned under the current ring",
        ))?;
        registry.register(Box::new(vectors_local.clone()))?;

        let transfer_tasks = IntCounterVec::new(
            Opts::new(
                "lattice_transfer_tasks_total",
                "Transfer task transitions by state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(transfer_tasks.clone()))?;

        let rebalance_operations = IntCounter::with_opts(Opts::new(
            "lattice_rebalance_operations_total",
            "Rebalance operations triggered",
        ))?;
        registry.register(Box::new(rebalance_operations.clone()))?;

        let rebalance_active = IntGauge::with_opts(Opts::new(
            "lattice_rebalance_active",
            "Rebalance operations not yet terminal",
        ))?;
        registry.register(Box::new(rebalance_active.clone()))?;

        Ok(Self {
            registry,
            query_latency,
            query_count,
            vectors_total,
            vectors_local,
            transfer_tasks,
            rebalance_operations,
            rebalance_active,
        })
    }

    /// Records one search and its latency.
    pub fn record_query(&self, latency: Duration) {
        self.query_count.inc();
        self.query_latency.observe(latency.as_secs_f64());
    }

    /// Updates the vector gauges.
    pub fn set_vector_counts(&self, total: usize, local: usize) {
        self.vectors_total.set(total as i64);
        self.vectors_local.set(local as i64);
    }

    /// Counts a transfer task transition into `state`.
    pub fn record_task_transition(&self, state: &str) {
        self.transfer_tasks.with_label_values(&[state]).inc();
    }

    /// Counts a rebalance trigger.
    pub fn record_rebalance_started(&self) {
        self.rebalance_operations.inc();
        self.rebalance_active.inc();
    }

    /// Marks a rebalance as terminal.
    pub fn record_rebalance_finished(&self) {
        self.rebalance_active.dec();
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn export(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(MetricsError::from)?;
        String::from_utf8(buffer).map_err(|e| MetricsError(e.to_string()))
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_registered_metrics() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.record_query(Duration::from_millis(3));
        metrics.set_vector_counts(100, 60);
        metrics.record_task_transition("completed");
        metrics.record_rebalance_started();

        let output = metrics.export().unwrap();
        assert!(output.contains("lattice_query_total 1"));
        assert!(output.contains("lattice_vectors_total 100"));
        assert!(output.contains("lattice_vectors_local 60"));
        assert!(output.contains("lattice_rebalance_active 1"));
    }

    #[test]
    fn test_rebalance_active_gauge() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.record_rebalance_started();
        metrics.record_rebalance_started();
        metrics.record_rebalance_finished();

        let output = metrics.export().unwrap();
        assert!(output.contains("lattice_rebalance_active 1"));
    }
}
