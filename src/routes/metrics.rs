use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;

/// Register descriptions for every metric the service emits.
pub fn describe() {
    metrics::describe_counter!(
        "photo_search_jobs_submitted",
        "Total face search jobs submitted"
    );
    metrics::describe_counter!(
        "photo_search_jobs_completed",
        "Total face search jobs completed"
    );
    metrics::describe_counter!(
        "photo_search_jobs_failed",
        "Total face search jobs that failed"
    );
    metrics::describe_counter!(
        "photo_search_photos_total",
        "Corpus photos inspected, by outcome"
    );
    metrics::describe_histogram!(
        "photo_search_job_seconds",
        "Time to process a face search job"
    );
    metrics::describe_gauge!(
        "photo_search_queue_depth",
        "Current number of pending search jobs"
    );
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Install the recorder with its own HTTP listener on `addr`, for processes
/// that do not serve the API router.
pub fn serve_on(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    Ok(())
}
