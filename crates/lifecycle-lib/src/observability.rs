//! Observability infrastructure for the model lifecycle
//!
//! Provides:
//! - Prometheus metrics for the prediction service (request counts, latency, labels served)
//! - Structured JSON logging of lifecycle milestones with tracing

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Default histogram buckets for request latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

struct ServiceMetricsInner {
    registry: Registry,
    requests_total: IntCounterVec,
    request_latency_seconds: HistogramVec,
    predictions_total: IntCounterVec,
    audit_failures_total: IntCounter,
}

/// Prediction service metrics
///
/// Each instance owns its own registry so tests and embedded servers never
/// collide on metric names. Clones share the same counters.
#[derive(Clone)]
pub struct ServiceMetrics {
    inner: Arc<ServiceMetricsInner>,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "prediction_service_requests_total",
                "Requests handled by the prediction service",
            ),
            &["endpoint"],
        )
        .expect("Failed to create requests_total");

        let request_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "prediction_service_request_latency_seconds",
                "Time spent handling a request",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["endpoint"],
        )
        .expect("Failed to create request_latency_seconds");

        let predictions_total = IntCounterVec::new(
            Opts::new(
                "prediction_service_predictions_total",
                "Predictions served, by predicted label",
            ),
            &["label"],
        )
        .expect("Failed to create predictions_total");

        let audit_failures_total = IntCounter::new(
            "prediction_service_audit_failures_total",
            "Predictions whose audit record could not be written",
        )
        .expect("Failed to create audit_failures_total");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("Failed to register requests_total");
        registry
            .register(Box::new(request_latency_seconds.clone()))
            .expect("Failed to register request_latency_seconds");
        registry
            .register(Box::new(predictions_total.clone()))
            .expect("Failed to register predictions_total");
        registry
            .register(Box::new(audit_failures_total.clone()))
            .expect("Failed to register audit_failures_total");

        Self {
            inner: Arc::new(ServiceMetricsInner {
                registry,
                requests_total,
                request_latency_seconds,
                predictions_total,
                audit_failures_total,
            }),
        }
    }

    /// Count one request to `endpoint` and record how long it took
    pub fn observe_request(&self, endpoint: &str, duration_secs: f64) {
        self.inner.requests_total.with_label_values(&[endpoint]).inc();
        self.inner
            .request_latency_seconds
            .with_label_values(&[endpoint])
            .observe(duration_secs);
    }

    pub fn inc_prediction(&self, label: i64) {
        self.inner
            .predictions_total
            .with_label_values(&[&label.to_string()])
            .inc();
    }

    pub fn inc_audit_failures(&self) {
        self.inner.audit_failures_total.inc();
    }

    pub fn request_count(&self, endpoint: &str) -> u64 {
        self.inner.requests_total.with_label_values(&[endpoint]).get()
    }

    pub fn audit_failures(&self) -> u64 {
        self.inner.audit_failures_total.get()
    }

    /// Text exposition of every metric in this instance's registry
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.inner.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Structured logger for lifecycle events
///
/// Every method emits one event with a stable `event` field so log
/// pipelines can filter on milestones.
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

    pub fn log_data_check(&self, dataset: &str, status: &str, digest: Option<&str>, changed: bool) {
        info!(
            event = "data_change_checked",
            component = %self.component,
            dataset = %dataset,
            status = %status,
            digest = ?digest,
            changed = changed,
            "Dataset change check complete"
        );
    }

    pub fn log_candidate_trained(&self, model_type: &str, run_id: &str, accuracy: f64, weighted_f1: f64) {
        info!(
            event = "candidate_trained",
            component = %self.component,
            model_type = %model_type,
            run_id = %run_id,
            accuracy = accuracy,
            f1_score = weighted_f1,
            "Trained candidate model"
        );
    }

    pub fn log_model_promoted(
        &self,
        model_name: &str,
        version: u64,
        model_type: &str,
        metric: &str,
        metric_value: f64,
        snapshot: &str,
    ) {
        info!(
            event = "model_promoted",
            component = %self.component,
            model_name = %model_name,
            version = version,
            model_type = %model_type,
            metric = %metric,
            metric_value = metric_value,
            snapshot = %snapshot,
            "Promoted new model version"
        );
    }

    /// Log the undo of a partially completed promotion
    pub fn log_promotion_compensated(&self, model_name: &str, version: u64, reason: &str, success: bool) {
        if success {
            warn!(
                event = "promotion_compensated",
                component = %self.component,
                model_name = %model_name,
                version = version,
                reason = %reason,
                "Promotion rolled back, previous active version unchanged"
            );
        } else {
            warn!(
                event = "promotion_compensated",
                component = %self.component,
                model_name = %model_name,
                version = version,
                reason = %reason,
                success = false,
                "Promotion rollback incomplete, registry may hold an orphan version"
            );
        }
    }

    pub fn log_model_resolved(&self, source: &str, model_type: &str, fallback: bool) {
        if fallback {
            warn!(
                event = "model_resolved",
                component = %self.component,
                source = %source,
                model_type = %model_type,
                fallback = true,
                "Registry unavailable, serving local snapshot"
            );
        } else {
            info!(
                event = "model_resolved",
                component = %self.component,
                source = %source,
                model_type = %model_type,
                fallback = false,
                "Resolved active model from registry"
            );
        }
    }

    pub fn log_prediction(&self, features: &[f64], prediction: i64, latency_secs: f64) {
        info!(
            event = "prediction_served",
            component = %self.component,
            features = ?features,
            prediction = prediction,
            latency_secs = latency_secs,
            "Served prediction"
        );
    }

    pub fn log_startup(&self, version: &str, model_source: &str) {
        info!(
            event = "server_started",
            component = %self.component,
            server_version = %version,
            model_source = %model_source,
            "Prediction server started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "server_shutdown",
            component = %self.component,
            reason = %reason,
            "Prediction server shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_do_not_share_counters() {
        let a = ServiceMetrics::new();
        let b = ServiceMetrics::new();

        a.observe_request("metrics", 0.01);
        a.observe_request("metrics", 0.02);

        assert_eq!(a.request_count("metrics"), 2);
        assert_eq!(b.request_count("metrics"), 0);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = ServiceMetrics::new();
        let clone = metrics.clone();
        clone.inc_audit_failures();
        assert_eq!(metrics.audit_failures(), 1);
    }

    #[test]
    fn test_encode_exposes_named_series() {
        let metrics = ServiceMetrics::new();
        metrics.observe_request("metrics", 0.003);
        metrics.inc_prediction(2);

        let text = metrics.encode().unwrap();
        assert!(text.contains("prediction_service_requests_total{endpoint=\"metrics\"} 1"));
        assert!(text.contains("prediction_service_request_latency_seconds_bucket"));
        assert!(text.contains("prediction_service_predictions_total{label=\"2\"} 1"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("pipeline");
        assert_eq!(logger.component, "pipeline");
    }
}
