//! HTTP surface tests: the axum router driven in-process.
//!
//! Run with: cargo test --test http_test

mod fixtures;
mod helpers;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use crop_queue::models::job::JobId;
use crop_queue::models::progress::{ErrorResponse, ProgressReport, SubmitResponse};
use crop_queue::routes;

use fixtures::*;
use helpers::*;

const BOUNDARY: &str = "crop-queue-test-boundary";

fn multipart_request(field: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::post("/submit")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

async fn poll_http(app: &Router, job_id: JobId) -> Vec<ProgressReport> {
    let mut reports = Vec::new();
    for _ in 0..2_000 {
        let (status, _, body) = send(app, get(&format!("/progress?jobid={job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        let report: ProgressReport = serde_json::from_slice(&body).unwrap();
        let done = matches!(report.state, Some(s) if s.is_terminal());
        reports.push(report);
        if done {
            return reports;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("job {job_id} did not finish over HTTP");
}

#[tokio::test]
async fn test_submit_poll_and_download() {
    let harness = Harness::start(1).await;
    let app = routes::router(harness.state.clone(), 10 * 1024 * 1024);

    let (status, _, body) = send(&app, multipart_request("image", "square.png", &png_bytes(500, 500))).await;
    assert_eq!(status, StatusCode::OK);
    let submitted: SubmitResponse = serde_json::from_slice(&body).unwrap();

    let reports = poll_http(&app, submitted.job_id).await;
    assert_monotonic(&reports);
    let last = serde_json::to_value(reports.last().unwrap()).unwrap();
    assert_eq!(last, serde_json::json!({"state": "SUCCESS", "progress": 1.0}));

    let (status, headers, body) = send(&app, get(&format!("/result?jobid={}", submitted.job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/png");
    let result = image::load_from_memory(&body).unwrap();
    assert_eq!((result.width(), result.height()), (300, 300));

    // The legacy path serves the same bytes.
    let (status, _, legacy) = send(&app, get(&format!("/result.png?jobid={}", submitted.job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(legacy, body);

    harness.stop().await;
}

#[tokio::test]
async fn test_empty_upload_is_bad_request() {
    let harness = Harness::start(0).await;
    let app = routes::router(harness.state.clone(), 1024 * 1024);

    let (status, _, body) = send(&app, multipart_request("image", "empty.png", b"")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert!(error.error.contains("empty"));
    assert_eq!(harness.queue.depth().await.unwrap(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_non_image_is_unsupported_media_type() {
    let harness = Harness::start(0).await;
    let app = routes::router(harness.state.clone(), 1024 * 1024);

    let (status, _, _) = send(&app, multipart_request("image", "notes.txt", b"just some text")).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(harness.queue.depth().await.unwrap(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_missing_image_field_is_bad_request() {
    let harness = Harness::start(0).await;
    let app = routes::router(harness.state.clone(), 1024 * 1024);

    let (status, _, _) = send(&app, multipart_request("file", "square.png", &png_bytes(10, 10))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    harness.stop().await;
}

#[tokio::test]
async fn test_oversized_upload_is_payload_too_large() {
    let harness = Harness::start(0).await;
    let app = routes::router(harness.state.clone(), 1024);

    let (status, _, body) = send(&app, multipart_request("image", "big.png", &vec![0x42; 16 * 1024])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert!(!error.error.is_empty());
    assert_eq!(harness.queue.depth().await.unwrap(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_job_endpoints() {
    let harness = Harness::start(0).await;
    let app = routes::router(harness.state.clone(), 1024 * 1024);
    let unknown = JobId::new();

    let (status, _, body) = send(&app, get(&format!("/progress?jobid={unknown}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"{}");

    let (status, _, body) = send(&app, get("/progress")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"{}");

    let (status, _, _) = send(&app, get(&format!("/result?jobid={unknown}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&app, get("/result")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    harness.stop().await;
}

#[tokio::test]
async fn test_failed_job_result_is_not_found() {
    let harness = Harness::start(1).await;
    let app = routes::router(harness.state.clone(), 1024 * 1024);

    let (status, _, body) = send(&app, multipart_request("image", "corrupt.png", &corrupt_png())).await;
    assert_eq!(status, StatusCode::OK);
    let submitted: SubmitResponse = serde_json::from_slice(&body).unwrap();

    let reports = poll_http(&app, submitted.job_id).await;
    assert_monotonic(&reports);

    let (status, headers, body) = send(&app, get(&format!("/result?jobid={}", submitted.job_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
    let failed: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert!(failed.error.starts_with("Job failed: decode: "), "{}", failed.error);

    // An unknown id is distinguishable from a failed job.
    let (status, _, body) = send(&app, get(&format!("/result?jobid={}", JobId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let unknown: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(unknown.error, "Job not found");

    harness.stop().await;
}

#[tokio::test]
async fn test_health_reports_ok_for_memory_backends() {
    let harness = Harness::start(0).await;
    let app = routes::router(harness.state.clone(), 1024 * 1024);

    let (status, _, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["checks"]["job_store"]["status"], "ok");
    assert_eq!(health["checks"]["broker"]["status"], "ok");

    harness.stop().await;
}
