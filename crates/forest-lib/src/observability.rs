//! Observability for the monitoring pipeline
//!
//! Provides:
//! - Prometheus metrics (run and stage latency, outcomes, scheduler state)
//! - Structured lifecycle events through tracing

use crate::error::{PipelineError, Stage};
use crate::models::{ObservationKey, StoredRecord};
use prometheus::{
    register_gauge_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, GaugeVec, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for run and stage latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    run_duration_seconds: Histogram,
    stage_duration_seconds: HistogramVec,
    runs_total: IntCounterVec,
    stage_failures_total: IntCounterVec,
    skipped_fires_total: IntCounter,
    armed_entries: IntGauge,
    last_success_timestamp: IntGauge,
    classifier_info: GaugeVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            run_duration_seconds: register_histogram!(
                "forest_monitor_run_duration_seconds",
                "Wall time of one acquisition-to-persistence run",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register run_duration_seconds"),

            stage_duration_seconds: register_histogram_vec!(
                "forest_monitor_stage_duration_seconds",
                "Wall time spent in each pipeline stage",
                &["stage"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register stage_duration_seconds"),

            runs_total: register_int_counter_vec!(
                "forest_monitor_runs_total",
                "Completed runs by outcome",
                &["outcome"]
            )
            .expect("Failed to register runs_total"),

            stage_failures_total: register_int_counter_vec!(
                "forest_monitor_stage_failures_total",
                "Failed runs by the stage that failed",
                &["stage"]
            )
            .expect("Failed to register stage_failures_total"),

            skipped_fires_total: register_int_counter!(
                "forest_monitor_skipped_fires_total",
                "Scheduled fires dropped because the previous run was still in flight"
            )
            .expect("Failed to register skipped_fires_total"),

            armed_entries: register_int_gauge!(
                "forest_monitor_armed_entries",
                "Number of armed schedule entries"
            )
            .expect("Failed to register armed_entries"),

            last_success_timestamp: register_int_gauge!(
                "forest_monitor_last_success_timestamp_seconds",
                "Unix time of the last successfully stored observation"
            )
            .expect("Failed to register last_success_timestamp"),

            classifier_info: register_gauge_vec!(
                "forest_monitor_classifier_info",
                "Information about the loaded scoring model",
                &["model"]
            )
            .expect("Failed to register classifier_info"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn observe_stage(&self, stage: Stage, elapsed: Duration) {
        self.inner()
            .stage_duration_seconds
            .with_label_values(&[stage.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_success(&self, elapsed: Duration) {
        let inner = self.inner();
        inner.run_duration_seconds.observe(elapsed.as_secs_f64());
        inner.runs_total.with_label_values(&["success"]).inc();
        inner
            .last_success_timestamp
            .set(chrono::Utc::now().timestamp());
    }

    pub fn record_failure(&self, stage: Stage, elapsed: Duration) {
        let inner = self.inner();
        inner.run_duration_seconds.observe(elapsed.as_secs_f64());
        inner.runs_total.with_label_values(&["failure"]).inc();
        inner
            .stage_failures_total
            .with_label_values(&[stage.as_str()])
            .inc();
    }

    pub fn inc_skipped_fires(&self) {
        self.inner().skipped_fires_total.inc();
    }

    pub fn set_armed_entries(&self, count: usize) {
        self.inner().armed_entries.set(count as i64);
    }

    pub fn set_classifier(&self, model: &str) {
        self.inner().classifier_info.reset();
        self.inner()
            .classifier_info
            .with_label_values(&[model])
            .set(1.0);
    }

    pub fn runs_total(&self, outcome: &str) -> u64 {
        self.inner().runs_total.with_label_values(&[outcome]).get()
    }

    pub fn stage_failures(&self, stage: Stage) -> u64 {
        self.inner()
            .stage_failures_total
            .with_label_values(&[stage.as_str()])
            .get()
    }

    pub fn skipped_fires(&self) -> u64 {
        self.inner().skipped_fires_total.get()
    }
}

/// Structured logger for lifecycle events
///
/// Every event carries an `event` field so JSON logs can be filtered without
/// parsing messages.
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

    pub fn log_startup(&self, version: &str, model: &str, entries: usize) {
        info!(
            event = "agent_started",
            instance = %self.instance,
            agent_version = %version,
            model = %model,
            entries = entries,
            "Forest monitor started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Forest monitor shutting down"
        );
    }

    pub fn log_observation(&self, record: &StoredRecord, elapsed: Duration) {
        let (label, probability) = record.result.dominant();
        info!(
            event = "observation_recorded",
            instance = %self.instance,
            key = %record.key(),
            dominant = %label,
            probability = probability,
            model = %record.result.model(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Observation recorded"
        );
    }

    /// Expected conditions such as missing imagery log at info, the rest at warn
    pub fn log_failure(&self, key: &ObservationKey, err: &PipelineError, attempt: u32) {
        if err.is_no_imagery() {
            info!(
                event = "observation_failed",
                instance = %self.instance,
                key = %key,
                stage = %err.stage,
                kind = err.cause.kind(),
                cause = %err.cause,
                retryable = false,
                attempt = attempt,
                "No imagery available"
            );
        } else {
            warn!(
                event = "observation_failed",
                instance = %self.instance,
                key = %key,
                stage = %err.stage,
                kind = err.cause.kind(),
                cause = %err.cause,
                retryable = err.is_retryable(),
                attempt = attempt,
                "Observation failed"
            );
        }
    }

    pub fn log_fire_skipped(&self, site: &str) {
        warn!(
            event = "fire_skipped",
            instance = %self.instance,
            site = %site,
            "Previous run still in flight, skipping fire"
        );
    }

    pub fn log_entry_armed(&self, site: &str, fire_time: &str, replaced: bool) {
        if replaced {
            info!(
                event = "entry_replaced",
                instance = %self.instance,
                site = %site,
                fire_time = %fire_time,
                "Schedule entry replaced"
            );
        } else {
            info!(
                event = "entry_armed",
                instance = %self.instance,
                site = %site,
                fire_time = %fire_time,
                "Schedule entry armed"
            );
        }
    }

    pub fn log_entry_cancelled(&self, site: &str) {
        info!(
            event = "entry_cancelled",
            instance = %self.instance,
            site = %site,
            "Schedule entry cancelled"
        );
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new("forest-agent")
    }
}
