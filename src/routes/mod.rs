use axum::extract::multipart::MultipartError;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::models::job::ErrorDetail;
use crate::models::progress::ErrorResponse;
use crate::services::job_store::JobStoreError;
use crate::services::status::FetchError;
use crate::services::submission::{SubmitError, ValidationError};

pub mod health;
pub mod jobs;
pub mod metrics;

/// Job routes plus the standard middleware stack.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/submit", post(jobs::submit))
        .route("/progress", get(jobs::progress))
        .route("/result", get(jobs::result))
        .route("/result.png", get(jobs::result))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        // A single length limit, so oversized multipart bodies surface as 413.
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
}

/// Errors surfaced to HTTP clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{}", .0.body_text())]
    Multipart(#[from] MultipartError),

    #[error("Job not found")]
    NotFound,

    #[error("Job failed: {0}")]
    JobFailed(ErrorDetail),

    #[error("Job did not finish in time")]
    NotReady,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(ValidationError::EmptyUpload) => StatusCode::BAD_REQUEST,
            ApiError::Validation(ValidationError::UnsupportedFormat(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ApiError::Multipart(e) => e.status(),
            ApiError::NotFound | ApiError::JobFailed(_) => StatusCode::NOT_FOUND,
            ApiError::NotReady => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JobStoreError> for ApiError {
    fn from(e: JobStoreError) -> Self {
        if e.is_transient() {
            ApiError::Unavailable(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Validation(v) => ApiError::Validation(v),
            SubmitError::Queue(q) if q.is_transient() => ApiError::Unavailable(q.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NotFound => ApiError::NotFound,
            // No partial artifact is served for a failed job.
            FetchError::Failed(detail) => ApiError::JobFailed(detail),
            FetchError::NotReady(_) => ApiError::NotReady,
            FetchError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}
