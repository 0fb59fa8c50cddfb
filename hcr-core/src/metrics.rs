//! Prometheus metrics for HCR

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

/// Units handed to the executor
static UNITS_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hcr_units_dispatched_total", "Total number of test units dispatched"),
        &["pass", "strategy"]
    )
    .expect("Failed to create units_dispatched metric")
});

/// Unit outcomes (pass, fail, timeout, inconclusive, not_dispatched)
static UNIT_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hcr_unit_outcomes_total", "Total number of test unit outcomes"),
        &["outcome"]
    )
    .expect("Failed to create unit_outcomes metric")
});

/// Eligible nodes seen by the last tick
static ELIGIBLE_NODES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "hcr_eligible_nodes",
        "Number of nodes eligible for testing in the last tick"
    ))
    .expect("Failed to create eligible_nodes metric")
});

/// Units in flight at the start of the last tick
static IN_FLIGHT_UNITS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "hcr_in_flight_units",
        "Number of test units in flight at the start of the last tick"
    ))
    .expect("Failed to create in_flight_units metric")
});

static TICK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "hcr_tick_duration_seconds",
        "Duration of scheduling ticks",
        &["result"],
        vec![0.1, 1.0, 10.0, 60.0, 300.0, 600.0, 1200.0, 3600.0]
    )
    .expect("Failed to create tick_duration metric")
});

static UNIT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "hcr_unit_duration_seconds",
        "Duration of test units from dispatch to record",
        &["pass"],
        vec![1.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0]
    )
    .expect("Failed to create unit_duration metric")
});

/// Failure taints written
static TAINTS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hcr_taints_applied_total", "Total number of failure taints applied"),
        &["value"]
    )
    .expect("Failed to create taints_applied metric")
});

/// Metrics registry wrapper
#[derive(Debug, Clone, Copy)]
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*UNITS_DISPATCHED;
        let _ = &*UNIT_OUTCOMES;
        let _ = &*ELIGIBLE_NODES;
        let _ = &*IN_FLIGHT_UNITS;
        let _ = &*TICK_DURATION;
        let _ = &*UNIT_DURATION;
        let _ = &*TAINTS_APPLIED;
        Self
    }

    pub fn inc_units_dispatched(&self, pass: &str, strategy: &str) {
        UNITS_DISPATCHED.with_label_values(&[pass, strategy]).inc();
    }

    pub fn inc_unit_outcome(&self, outcome: &str) {
        UNIT_OUTCOMES.with_label_values(&[outcome]).inc();
    }

    pub fn set_eligible_nodes(&self, count: i64) {
        ELIGIBLE_NODES.set(count);
    }

    pub fn set_in_flight_units(&self, count: i64) {
        IN_FLIGHT_UNITS.set(count);
    }

    /// Record tick duration; `result` is `ok` or `error`
    pub fn observe_tick_duration(&self, result: &str, duration_secs: f64) {
        TICK_DURATION
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn observe_unit_duration(&self, pass: &str, duration_secs: f64) {
        UNIT_DURATION
            .with_label_values(&[pass])
            .observe(duration_secs);
    }

    pub fn inc_taints_applied(&self, value: &str, count: u64) {
        TAINTS_APPLIED.with_label_values(&[value]).inc_by(count);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
