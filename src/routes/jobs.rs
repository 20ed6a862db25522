use axum::extract::{Multipart, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::models::progress::{ProgressReport, SubmitResponse};
use crate::models::upload::Upload;
use crate::routes::ApiError;
use crate::services::storage::content_type_for;

/// `?jobid=<id>` query used by the status endpoints.
#[derive(Debug, Deserialize)]
pub struct JobQuery {
    pub jobid: Option<String>,
}

/// POST /submit: Upload an image (multipart field `image`) for cropping.
pub async fn submit(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, ApiError> {
    let mut upload: Option<Upload> = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("image") {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let data = field.bytes().await?;
            upload = Some(Upload::new(filename, data.to_vec()));
        }
    }

    let upload = upload.ok_or_else(|| ApiError::BadRequest("missing `image` field".to_string()))?;
    let job_id = state.submission.submit(upload).await?;

    Ok(Json(SubmitResponse { job_id }))
}

/// GET /progress?jobid=<id>: Current state and progress; `{}` for unknown jobs.
pub async fn progress(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Json<ProgressReport>, ApiError> {
    let Some(job_id) = query.jobid else {
        return Ok(Json(ProgressReport::unknown()));
    };
    let report = state.status.poll(&job_id).await?;
    Ok(Json(report))
}

/// GET /result?jobid=<id>: The cropped image once the job succeeded.
pub async fn result(
    State(state): State<AppState>,
    Query(query): Query<JobQuery>,
) -> Result<Response, ApiError> {
    let job_id = query.jobid.ok_or(ApiError::NotFound)?;
    let location = state.status.fetch(&job_id).await?;

    let bytes = state.storage.read_artifact(&location).await.map_err(|e| {
        tracing::error!(job_id = %job_id, location = %location, error = %e, "Result artifact missing");
        ApiError::NotFound
    })?;

    Ok(([(header::CONTENT_TYPE, content_type_for(&location))], bytes).into_response())
}
