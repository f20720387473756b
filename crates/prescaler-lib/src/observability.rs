//! Observability infrastructure for the event prescaler
//!
//! Provides:
//! - Prometheus metrics (event transitions, execution and provisioning latency,
//!   autoscaler updates, observation samples, cache efficiency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for event executions and provider operations (in seconds)
const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PrescalerMetricsInner> = OnceLock::new();

struct PrescalerMetricsInner {
    events_started: IntCounterVec,
    event_transitions: IntCounterVec,
    execution_duration_seconds: Histogram,
    executions_in_flight: IntGauge,
    pool_ceiling_raises: IntCounter,
    provisioning_duration_seconds: Histogram,
    autoscaler_updates: IntCounterVec,
    observation_samples: IntCounterVec,
    sampling_errors: IntCounter,
    autoscaler_cache_lookups: IntCounterVec,
}

impl PrescalerMetricsInner {
    fn new() -> Self {
        Self {
            events_started: register_int_counter_vec!(
                "event_prescaler_events_started_total",
                "Event runs started by the driver, per path",
                &["path"]
            )
            .expect("Failed to register events_started"),

            event_transitions: register_int_counter_vec!(
                "event_prescaler_event_transitions_total",
                "Event status transitions persisted, per target status",
                &["status"]
            )
            .expect("Failed to register event_transitions"),

            execution_duration_seconds: register_histogram!(
                "event_prescaler_execution_duration_seconds",
                "Wall time of one execute path run",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register execution_duration_seconds"),

            executions_in_flight: register_int_gauge!(
                "event_prescaler_executions_in_flight",
                "Event runs currently in progress"
            )
            .expect("Failed to register executions_in_flight"),

            pool_ceiling_raises: register_int_counter!(
                "event_prescaler_pool_ceiling_raises_total",
                "Node pool max node count raises completed"
            )
            .expect("Failed to register pool_ceiling_raises"),

            provisioning_duration_seconds: register_histogram!(
                "event_prescaler_provisioning_duration_seconds",
                "Time from ceiling update submission to operation completion",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register provisioning_duration_seconds"),

            autoscaler_updates: register_int_counter_vec!(
                "event_prescaler_autoscaler_updates_total",
                "Autoscaler object writes, per result",
                &["result"]
            )
            .expect("Failed to register autoscaler_updates"),

            observation_samples: register_int_counter_vec!(
                "event_prescaler_observation_samples_total",
                "Observation samples persisted during watch, per kind",
                &["kind"]
            )
            .expect("Failed to register observation_samples"),

            sampling_errors: register_int_counter!(
                "event_prescaler_sampling_errors_total",
                "Watch sampling rounds that failed"
            )
            .expect("Failed to register sampling_errors"),

            autoscaler_cache_lookups: register_int_counter_vec!(
                "event_prescaler_autoscaler_cache_lookups_total",
                "Autoscaler list cache lookups, per result",
                &["result"]
            )
            .expect("Failed to register autoscaler_cache_lookups"),
        }
    }
}

/// Prescaler metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct PrescalerMetrics {
    _private: (),
}

impl Default for PrescalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrescalerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PrescalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PrescalerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Count a run started by the driver (`execute`, `watch` or `finalize`)
    pub fn inc_events_started(&self, path: &str) {
        self.inner().events_started.with_label_values(&[path]).inc();
    }

    pub fn inc_event_transition(&self, status: &str) {
        self.inner().event_transitions.with_label_values(&[status]).inc();
    }

    pub fn observe_execution_duration(&self, duration_secs: f64) {
        self.inner().execution_duration_seconds.observe(duration_secs);
    }

    pub fn inc_in_flight(&self) {
        self.inner().executions_in_flight.inc();
    }

    pub fn dec_in_flight(&self) {
        self.inner().executions_in_flight.dec();
    }

    /// Record a completed ceiling raise and how long the provider took
    pub fn observe_ceiling_raise(&self, duration_secs: f64) {
        self.inner().pool_ceiling_raises.inc();
        self.inner().provisioning_duration_seconds.observe(duration_secs);
    }

    pub fn inc_autoscaler_update(&self, success: bool) {
        let result = if success { "success" } else { "failed" };
        self.inner().autoscaler_updates.with_label_values(&[result]).inc();
    }

    pub fn add_observation_samples(&self, kind: &str, count: usize) {
        self.inner()
            .observation_samples
            .with_label_values(&[kind])
            .inc_by(count as u64);
    }

    pub fn inc_sampling_errors(&self) {
        self.inner().sampling_errors.inc();
    }

    pub fn inc_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.inner()
            .autoscaler_cache_lookups
            .with_label_values(&[result])
            .inc();
    }
}

/// Structured logger for prescaler events
///
/// Emits one log line per domain event with a stable `event` key so the
/// JSON output can be filtered without parsing messages.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, tick_interval_secs: u64) {
        info!(
            event = "prescaler_started",
            instance = %self.instance,
            version = %version,
            tick_interval_secs = tick_interval_secs,
            "Event prescaler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "prescaler_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Event prescaler shutting down"
        );
    }

    /// Log an event status transition, at warn level when it failed
    pub fn log_status_transition(&self, event_name: &str, status: &str, message: &str) {
        if status == "FAILED" {
            warn!(
                event = "event_status_changed",
                instance = %self.instance,
                event_name = %event_name,
                status = %status,
                message = %message,
                "Event failed"
            );
        } else {
            info!(
                event = "event_status_changed",
                instance = %self.instance,
                event_name = %event_name,
                status = %status,
                "Event status changed"
            );
        }
    }

    /// Log the planner's decision for one node pool
    pub fn log_pool_decision(
        &self,
        event_name: &str,
        pool: &str,
        current_max_nodes: i32,
        needed_nodes: i32,
        new_max_nodes: i32,
    ) {
        info!(
            event = "node_pool_planned",
            instance = %self.instance,
            event_name = %event_name,
            pool = %pool,
            current_max_nodes = current_max_nodes,
            needed_nodes = needed_nodes,
            new_max_nodes = new_max_nodes,
            "Planned node pool ceiling"
        );
    }

    pub fn log_change_failed(&self, event_name: &str, namespace: &str, name: &str, reason: &str) {
        warn!(
            event = "autoscaler_change_failed",
            instance = %self.instance,
            event_name = %event_name,
            namespace = %namespace,
            autoscaler = %name,
            reason = %reason,
            "Autoscaler change failed"
        );
    }

    pub fn log_sampling_error(&self, event_name: &str, target: &str, error: &str) {
        warn!(
            event = "watch_sampling_failed",
            instance = %self.instance,
            event_name = %event_name,
            target = %target,
            error = %error,
            "Failed to sample cluster state"
        );
    }
}
