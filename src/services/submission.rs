use std::sync::Arc;

use image::ImageFormat;

use crate::models::job::JobId;
use crate::models::upload::Upload;
use crate::services::queue::{QueueError, TaskMessage, TaskQueue};
use crate::services::storage::{StorageError, UploadStorage};

/// Accepts uploads, stores them and enqueues crop jobs.
pub struct SubmissionService {
    storage: Arc<UploadStorage>,
    queue: TaskQueue,
}

impl SubmissionService {
    pub fn new(storage: Arc<UploadStorage>, queue: TaskQueue) -> Self {
        Self { storage, queue }
    }

    /// Validate, persist and enqueue an upload; returns the new job's id.
    ///
    /// Invalid uploads are rejected before anything is written or queued.
    pub async fn submit(&self, upload: Upload) -> Result<JobId, SubmitError> {
        let format = match validate_upload(&upload) {
            Ok(format) => format,
            Err(e) => {
                metrics::counter!("crop_jobs_rejected_total").increment(1);
                tracing::info!(filename = %upload.filename, error = %e, "Rejected upload");
                return Err(e.into());
            }
        };

        let path = self
            .storage
            .save_upload(&upload.filename, &upload.data)
            .await?;
        let message = TaskMessage::new(path.to_string_lossy(), upload.filename);
        let job_id = self.queue.enqueue(&message).await?;

        metrics::counter!("crop_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job_id,
            format = ?format,
            size_bytes = upload.data.len(),
            "Upload accepted"
        );

        Ok(job_id)
    }
}

/// Cheap synchronous checks: non-empty and a recognised, decodable format.
///
/// Only the header is inspected; a file with a valid header but corrupt body
/// is accepted here and fails later in the worker.
pub fn validate_upload(upload: &Upload) -> Result<ImageFormat, ValidationError> {
    if upload.is_empty() {
        return Err(ValidationError::EmptyUpload);
    }

    let format = image::guess_format(&upload.data)
        .map_err(|_| ValidationError::UnsupportedFormat("unrecognised image data".to_string()))?;

    if !format.reading_enabled() {
        return Err(ValidationError::UnsupportedFormat(format!("{format:?}")));
    }

    Ok(format)
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Upload is empty")]
    EmptyUpload,

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to store upload: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}
