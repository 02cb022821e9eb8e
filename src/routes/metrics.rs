use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every metric the pipeline emits.
pub fn describe_metrics() {
    metrics::describe_counter!("cards_submitted_total", "Cards accepted into the dispatch queue");
    metrics::describe_counter!("cards_rejected_total", "Submissions refused by the dispatch queue");
    metrics::describe_counter!("cards_completed_total", "Cards that reached a final result, by status");
    metrics::describe_counter!("cards_failed_total", "Failed cards, by reason code");
    metrics::describe_counter!(
        "latency_budget_overruns_total",
        "Stages that exceeded their latency budget"
    );
    metrics::describe_histogram!(
        "remote_call_seconds",
        metrics::Unit::Seconds,
        "Wall time of a remote inference call including retries"
    );
    metrics::describe_histogram!(
        "card_pipeline_seconds",
        metrics::Unit::Seconds,
        "Time from submission to final result"
    );
    metrics::describe_gauge!("dispatch_queue_depth", "Items waiting in the dispatch queue");
    metrics::describe_gauge!(
        "circuit_state",
        "Circuit breaker state per endpoint (0 closed, 1 half open, 2 open)"
    );
}
