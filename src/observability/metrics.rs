//! # Metrics
//!
//! Prometheus metrics for the reconciliation loop: totals, durations, and
//! per-reason failure counters. Exposed by the probe server on `/metrics`.

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_controller_reconcile_total",
        "Total number of reconciliation attempts",
    )
    .expect("valid metric definition")
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "kustomize_controller_reconcile_duration_seconds",
            "Duration of reconciliation attempts in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
    )
    .expect("valid metric definition")
});

static RECONCILE_ERRORS_BY_REASON: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kustomize_controller_reconcile_errors_total",
            "Total number of failed reconciliations by condition reason",
        ),
        &["reason"],
    )
    .expect("valid metric definition")
});

static ARTIFACT_DOWNLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_controller_artifact_downloads_total",
        "Total number of artifact downloads",
    )
    .expect("valid metric definition")
});

static ARTIFACT_DOWNLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "kustomize_controller_artifact_download_duration_seconds",
            "Duration of artifact downloads in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
    )
    .expect("valid metric definition")
});

static PRUNED_OBJECTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_controller_pruned_objects_total",
        "Total number of orphaned objects deleted by the pruner",
    )
    .expect("valid metric definition")
});

static DEPENDENCY_BLOCKED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_controller_dependency_blocked_total",
        "Reconciliations deferred because a dependency was not ready",
    )
    .expect("valid metric definition")
});

/// Register every metric with the controller registry. Called once during
/// initialization.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_DURATION.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_ERRORS_BY_REASON.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOADS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOAD_DURATION.clone()))?;
    REGISTRY.register(Box::new(PRUNED_OBJECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEPENDENCY_BLOCKED_TOTAL.clone()))?;
    Ok(())
}

/// Render every registered metric in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}

pub fn increment_reconcile_total() {
    RECONCILE_TOTAL.inc();
}

pub fn observe_reconcile_duration(seconds: f64) {
    RECONCILE_DURATION.observe(seconds);
}

pub fn increment_reconcile_errors(reason: &str) {
    RECONCILE_ERRORS_BY_REASON.with_label_values(&[reason]).inc();
}

pub fn increment_artifact_downloads_total() {
    ARTIFACT_DOWNLOADS_TOTAL.inc();
}

pub fn observe_artifact_download_duration(seconds: f64) {
    ARTIFACT_DOWNLOAD_DURATION.observe(seconds);
}

pub fn increment_pruned_objects(count: u64) {
    PRUNED_OBJECTS_TOTAL.inc_by(count);
}

pub fn increment_dependency_blocked() {
    DEPENDENCY_BLOCKED_TOTAL.inc();
}
