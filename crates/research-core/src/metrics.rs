use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

use crate::evidence::EvidenceStatus;

struct PipelineMetrics {
    evidence: Counter<u64>,
    search_failures: Counter<u64>,
    stage_duration_ms: Histogram<f64>,
    requests: Counter<u64>,
}

static METRICS: OnceCell<PipelineMetrics> = OnceCell::new();

fn handles() -> &'static PipelineMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("research.pipeline");
        PipelineMetrics {
            evidence: meter
                .u64_counter("research_evidence_total")
                .with_description("Evidence records produced, by status")
                .init(),
            search_failures: meter
                .u64_counter("research_search_failures_total")
                .with_description("Sub-queries whose search call failed")
                .init(),
            stage_duration_ms: meter
                .f64_histogram("research_stage_duration_ms")
                .with_description("Pipeline stage runtime in milliseconds")
                .init(),
            requests: meter
                .u64_counter("research_requests_total")
                .with_description("Research requests by outcome")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("RESEARCH_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "RESEARCH_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export pipeline metrics."
        );
    }
}

pub(crate) fn record_evidence(status: EvidenceStatus) {
    handles()
        .evidence
        .add(1, &[KeyValue::new("status", status.as_str())]);
}

pub(crate) fn record_search_failure() {
    handles().search_failures.add(1, &[]);
}

pub(crate) fn record_stage_duration(stage: &'static str, duration_ms: u64) {
    handles()
        .stage_duration_ms
        .record(duration_ms as f64, &[KeyValue::new("stage", stage)]);
}

pub(crate) fn record_request(outcome: &'static str) {
    handles()
        .requests
        .add(1, &[KeyValue::new("outcome", outcome)]);
}
