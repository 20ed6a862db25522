use serde::{Deserialize, Serialize};

use crate::models::job::{Job, JobId, JobState, JobStatus};

/// Response after submitting an image.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

/// Body of `GET /progress`.
///
/// Serializes to `{}` for unknown jobs so existence is not leaked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl ProgressReport {
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Terminal jobs report 1.0 so the reported fraction never drops.
    pub fn from_job(job: &Job) -> Self {
        let progress = match job.status {
            JobStatus::Pending => 0.0,
            JobStatus::Progress { progress } => progress,
            JobStatus::Success { .. } | JobStatus::Failure { .. } => 1.0,
        };
        Self {
            state: Some(job.state()),
            progress: Some(progress),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.state.is_none()
    }
}

/// Error body returned by the HTTP surface.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::ErrorDetail;

    #[test]
    fn test_unknown_serializes_empty() {
        let body = serde_json::to_string(&ProgressReport::unknown()).unwrap();
        assert_eq!(body, "{}");
    }

    #[test]
    fn test_state_mapping() {
        let mut job = Job::pending(JobId::new());
        assert_eq!(ProgressReport::from_job(&job).progress, Some(0.0));

        job.status = JobStatus::Progress { progress: 0.5 };
        let report = ProgressReport::from_job(&job);
        assert_eq!(report.state, Some(JobState::Progress));
        assert_eq!(report.progress, Some(0.5));

        job.status = JobStatus::Success {
            result: "out/a.png".into(),
        };
        let value = serde_json::to_value(ProgressReport::from_job(&job)).unwrap();
        assert_eq!(value, serde_json::json!({"state": "SUCCESS", "progress": 1.0}));

        job.status = JobStatus::Failure {
            error: ErrorDetail::new("decode", "bad header"),
        };
        let report = ProgressReport::from_job(&job);
        assert_eq!(report.state, Some(JobState::Failure));
        assert_eq!(report.progress, Some(1.0));
    }
}
