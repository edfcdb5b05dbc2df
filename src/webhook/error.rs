use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    /// Bad configuration; never retried.
    #[error("invalid webhook config: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("webhook endpoint returned status {0}")]
    Status(u16),

    #[error("webhook request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to serialize webhook payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("webhook secret rejected as an HMAC key")]
    InvalidKey,
}

impl WebhookError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            WebhookError::Status(code) => Some(*code),
            WebhookError::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
