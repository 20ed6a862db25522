use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Install the Prometheus recorder and register the job metrics.
pub fn install_recorder() -> Result<Arc<PrometheusHandle>, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_counter!("crop_jobs_submitted_total", "Crop jobs accepted and enqueued");
    metrics::describe_counter!("crop_jobs_rejected_total", "Uploads rejected by validation");
    metrics::describe_counter!("crop_jobs_completed_total", "Crop jobs that succeeded");
    metrics::describe_counter!("crop_jobs_failed_total", "Crop jobs that failed");
    metrics::describe_histogram!(
        "crop_job_processing_seconds",
        "Time spent cropping and resizing one image"
    );
    metrics::describe_gauge!("crop_queue_depth", "Tasks waiting in the queue");

    Ok(Arc::new(handle))
}

/// Attach `GET /metrics` (separate state) to an existing router.
pub fn with_metrics(router: Router, handle: Arc<PrometheusHandle>) -> Router {
    router.route("/metrics", get(prometheus_metrics).with_state(handle))
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}
