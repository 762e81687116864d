//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `bundler_reconciliations_total` - Total number of reconciliations
//! - `bundler_reconciliation_errors_total` - Total number of reconciliation errors
//! - `bundler_reconcile_duration_seconds` - Duration of reconcile passes

use std::sync::LazyLock;

use prometheus::{Histogram, IntCounter, Registry};

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bundler_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("valid metric definition")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bundler_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("valid metric definition")
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "bundler_reconcile_duration_seconds",
            "Duration of one reconcile pass in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("valid metric definition")
});

/// Register all metrics with the shared registry; call once at startup.
pub fn register_metrics() -> anyhow::Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_DURATION.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconcile_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconcile_duration(seconds: f64) {
    RECONCILE_DURATION.observe(seconds);
}
