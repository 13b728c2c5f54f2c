//! Observability for the telemetry pipeline
//!
//! Provides:
//! - Prometheus metrics for ingestion, limiter decisions and client delivery
//! - Structured logging of named pipeline events with tracing

use crate::client::delivery::DeliveryOutcome;
use crate::client::flush::FlushReport;
use crate::models::Environment;
use crate::server::analyzer::Recommendation;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Latency buckets for ingestion requests (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Registered once per process
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    ingest_requests: IntCounterVec,
    ingest_latency_seconds: HistogramVec,
    events_accepted: IntCounter,
    events_duplicate: IntCounter,
    events_invalid: IntCounter,
    storage_failures: IntCounter,
    limits_applied: IntCounter,
    delivery_outcomes: IntCounterVec,
    flush_runs: IntCounterVec,
    queue_depth: IntGauge,
    queue_dropped: IntCounter,
    persistence_errors: IntCounter,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            ingest_requests: register_int_counter_vec!(
                "telemetry_ingest_requests_total",
                "Ingestion requests by route and limiter decision",
                &["route", "decision"]
            )
            .expect("Failed to register ingest_requests_total"),

            ingest_latency_seconds: register_histogram_vec!(
                "telemetry_ingest_latency_seconds",
                "Time spent handling an ingestion request",
                &["route"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register ingest_latency_seconds"),

            events_accepted: register_int_counter!(
                "telemetry_events_accepted_total",
                "Events handed to the analytics store"
            )
            .expect("Failed to register events_accepted_total"),

            events_duplicate: register_int_counter!(
                "telemetry_events_duplicate_total",
                "Events dropped as already stored"
            )
            .expect("Failed to register events_duplicate_total"),

            events_invalid: register_int_counter!(
                "telemetry_events_invalid_total",
                "Events skipped for failing shape validation"
            )
            .expect("Failed to register events_invalid_total"),

            storage_failures: register_int_counter!(
                "telemetry_storage_failures_total",
                "Failed writes to the analytics store"
            )
            .expect("Failed to register storage_failures_total"),

            limits_applied: register_int_counter!(
                "telemetry_limits_applied_total",
                "Rate limit changes applied by an administrator"
            )
            .expect("Failed to register limits_applied_total"),

            delivery_outcomes: register_int_counter_vec!(
                "telemetry_client_delivery_events_total",
                "Client events by delivery outcome",
                &["outcome"]
            )
            .expect("Failed to register client_delivery_events_total"),

            flush_runs: register_int_counter_vec!(
                "telemetry_client_flush_runs_total",
                "Offline queue flush runs by trigger",
                &["trigger"]
            )
            .expect("Failed to register client_flush_runs_total"),

            queue_depth: register_int_gauge!(
                "telemetry_client_queue_depth",
                "Events waiting in the offline queue"
            )
            .expect("Failed to register client_queue_depth"),

            queue_dropped: register_int_counter!(
                "telemetry_client_queue_dropped_total",
                "Queued events dropped by retention or the size cap"
            )
            .expect("Failed to register client_queue_dropped_total"),

            persistence_errors: register_int_counter!(
                "telemetry_client_persistence_errors_total",
                "Failed writes to the durable offline queue"
            )
            .expect("Failed to register client_persistence_errors_total"),
        }
    }
}

/// Handle to the process-wide pipeline metrics. Clones share the same
/// underlying collectors.
#[derive(Clone)]
pub struct PipelineMetrics {
    inner: &'static PipelineMetricsInner,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new),
        }
    }

    pub fn observe_ingest(&self, route: &str, decision: &str, duration: Duration) {
        self.inner
            .ingest_requests
            .with_label_values(&[route, decision])
            .inc();
        self.inner
            .ingest_latency_seconds
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }

    pub fn add_events(&self, accepted: usize, duplicates: usize, invalid: usize) {
        self.inner.events_accepted.inc_by(accepted as u64);
        self.inner.events_duplicate.inc_by(duplicates as u64);
        self.inner.events_invalid.inc_by(invalid as u64);
    }

    pub fn inc_storage_failures(&self) {
        self.inner.storage_failures.inc();
    }

    pub fn inc_limits_applied(&self, count: usize) {
        self.inner.limits_applied.inc_by(count as u64);
    }

    pub fn inc_delivery_outcome(&self, outcome: &str, events: usize) {
        self.inner
            .delivery_outcomes
            .with_label_values(&[outcome])
            .inc_by(events as u64);
    }

    pub fn observe_flush(&self, report: &FlushReport) {
        self.inner
            .flush_runs
            .with_label_values(&[&report.trigger.to_string()])
            .inc();
        self.inc_delivery_outcome("succeeded", report.delivered + report.verified);
        self.inc_delivery_outcome("assumed", report.assumed);
        self.inc_delivery_outcome("failed", report.failed);
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.inner.queue_depth.set(depth);
    }

    pub fn inc_queue_drops(&self, dropped: u64) {
        self.inner.queue_dropped.inc_by(dropped);
    }

    pub fn inc_persistence_errors(&self) {
        self.inner.persistence_errors.inc();
    }

    /// Every registered metric in Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Structured logger for named pipeline events
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str, environment: Environment, addr: &str) {
        info!(
            event = "gate_started",
            component = %self.component,
            version = %version,
            environment = ?environment,
            addr = %addr,
            "Telemetry gate started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "gate_shutdown",
            component = %self.component,
            reason = %reason,
            "Telemetry gate shutting down"
        );
    }

    pub fn log_rate_limited(&self, route: &str, key: &str, retry_after_secs: u64) {
        warn!(
            event = "rate_limited",
            component = %self.component,
            route = %route,
            key = %key,
            retry_after_secs,
            "Ingestion request rejected by rate limiter"
        );
    }

    pub fn log_storage_failure(&self, route: &str, events: usize, err: &str) {
        error!(
            event = "storage_failed",
            component = %self.component,
            route = %route,
            events,
            error = %err,
            "Analytics store rejected events"
        );
    }

    pub fn log_delivery_outcome(&self, outcome: &DeliveryOutcome, events: usize) {
        match outcome {
            DeliveryOutcome::Succeeded { strategy, ack } => info!(
                event = "delivery_outcome",
                component = %self.component,
                outcome = "succeeded",
                strategy = %strategy,
                events,
                accepted = ack.accepted,
                duplicates = ack.duplicates,
                invalid = ack.invalid,
                "Batch delivered"
            ),
            DeliveryOutcome::Assumed { strategy } => info!(
                event = "delivery_outcome",
                component = %self.component,
                outcome = "assumed",
                strategy = %strategy,
                events,
                "Batch sent best-effort, awaiting verification"
            ),
            DeliveryOutcome::Failed { .. } => {
                let error = outcome
                    .error()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                warn!(
                    event = "delivery_outcome",
                    component = %self.component,
                    outcome = "failed",
                    events,
                    error = %error,
                    "Batch delivery failed, queued for retry"
                )
            }
        }
    }

    pub fn log_retention_drop(&self, dropped: usize, retention: Duration) {
        warn!(
            event = "retention_drop",
            component = %self.component,
            dropped,
            retention_secs = retention.as_secs(),
            "Dropped events older than the retention ceiling"
        );
    }

    pub fn log_pipeline_stopped(&self, queued: usize) {
        info!(
            event = "pipeline_stopped",
            component = %self.component,
            queued,
            "Telemetry pipeline stopped"
        );
    }

    pub fn log_recommendation_applied(&self, recommendation: &Recommendation, dry_run: bool) {
        info!(
            event = "recommendation_applied",
            component = %self.component,
            route = %recommendation.route,
            classification = %recommendation.classification,
            old_max_requests = recommendation.current.max_requests,
            new_max_requests = recommendation.recommended.max_requests,
            dry_run,
            reason = %recommendation.reason,
            "Rate limit recommendation applied"
        );
    }
}
