// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the update-operator.
//!
//! All metrics live in a dedicated registry under the `klocksmith_`
//! namespace and are exposed by the operator's `/metrics` endpoint.

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::LazyLock;
use std::time::Duration;

/// Namespace prefix for all klocksmith metrics.
const METRICS_NAMESPACE: &str = "klocksmith";

/// Global Prometheus metrics registry.
///
/// All metrics are registered in this registry and exposed via the
/// `/metrics` endpoint.
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Total number of reconciliation cycles by outcome.
///
/// Labels:
/// - `status`: Outcome (`success`, `error`)
pub static RECONCILE_CYCLES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_reconcile_cycles_total"),
        "Total number of reconciliation cycles by outcome",
    );
    let counter = CounterVec::new(opts, &["status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of reconciliation cycles in seconds.
pub static RECONCILE_CYCLE_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_reconcile_cycle_duration_seconds"),
        "Duration of reconciliation cycles in seconds",
    )
    .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]);
    let histogram = HistogramVec::new(opts, &["status"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

/// Number of nodes currently occupying a reboot pipeline slot.
pub static NODES_IN_PIPELINE: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        format!("{METRICS_NAMESPACE}_nodes_in_reboot_pipeline"),
        "Number of nodes currently scheduled, permitted or rebooting",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Whether this operator replica currently holds the leader lease.
pub static LEADER_STATE: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        format!("{METRICS_NAMESPACE}_leader"),
        "1 while this replica holds the leader-election lease, 0 otherwise",
    )
    .unwrap();
    METRICS_REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Record the outcome and duration of one reconciliation cycle.
pub fn record_reconcile_cycle(success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };

    RECONCILE_CYCLES_TOTAL.with_label_values(&[status]).inc();
    RECONCILE_CYCLE_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration.as_secs_f64());
}

/// Record the current reboot pipeline occupancy.
pub fn set_nodes_in_pipeline(count: usize) {
    NODES_IN_PIPELINE.set(i64::try_from(count).unwrap_or(i64::MAX));
}

/// Record whether this replica is the leader.
pub fn set_leader(is_leader: bool) {
    LEADER_STATE.set(if is_leader { 1.0 } else { 0.0 });
}

/// Gather all registered metrics in the Prometheus text exposition format.
///
/// # Errors
///
/// Returns an error when encoding fails.
pub fn gather_metrics() -> anyhow::Result<String> {
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();

    TextEncoder::new().encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod metrics_tests;
