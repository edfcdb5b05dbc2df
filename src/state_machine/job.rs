use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a remote prediction.
///
/// `Starting → Processing → {Succeeded | Failed | Canceled}`; a short job may
/// go from `Starting` straight to a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses are final: nothing is emitted for the job afterwards.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status snapshot of one prediction as returned by the remote API.
///
/// Unknown fields (`version`, `urls`, `metrics`, ...) are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            status,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            logs: None,
        }
    }

    /// The error as display text; the API sends either a string or an object.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.trim().is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Starting.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn deserialize_from_api_format() {
        let api_json = r#"{
            "id": "pred_123",
            "version": "5c7d5dc6",
            "status": "processing",
            "created_at": "2024-01-01T12:00:00.000Z",
            "started_at": "2024-01-01T12:00:01.500Z",
            "completed_at": null,
            "output": null,
            "error": null,
            "logs": "loading weights\nprogress: 40%\n",
            "urls": {"get": "https://example.invalid"}
        }"#;
        let job: Job = serde_json::from_str(api_json).unwrap();
        assert_eq!(job.id, "pred_123");
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());
        assert_eq!(job.error_message(), None);
        assert!(job.logs.unwrap().contains("progress: 40%"));
    }

    #[test]
    fn error_message_accepts_strings_and_objects() {
        let mut job = Job::new("p", JobStatus::Failed);
        job.error = Some(serde_json::json!("CUDA out of memory"));
        assert_eq!(job.error_message().as_deref(), Some("CUDA out of memory"));

        job.error = Some(serde_json::json!({"detail": "bad input"}));
        assert_eq!(
            job.error_message().as_deref(),
            Some(r#"{"detail":"bad input"}"#)
        );

        job.error = Some(serde_json::json!(""));
        assert_eq!(job.error_message(), None);
    }

    #[test]
    fn status_display_matches_wire_format() {
        assert_eq!(JobStatus::Canceled.to_string(), "canceled");
        assert_eq!(
            serde_json::to_string(&JobStatus::Succeeded).unwrap(),
            r#""succeeded""#
        );
    }
}
