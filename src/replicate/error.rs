//! Error types for the predictions API client.
//!
//! [`ApiError`] separates throttling, HTTP-level failures, transport failures
//! and undecodable bodies, and implements [`Retryable`] so the retry engine
//! can decide on its own which of them are worth another attempt.

use std::time::Duration;

use thiserror::Error;

use crate::retry::Retryable;

/// Errors raised while talking to the predictions API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server answered HTTP 429.
    /// `retry_after_ms` is the wait it suggested (or a 1s default).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success HTTP status (401 bad token, 404 unknown id, 5xx...).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// DNS, connection refused, reset or timeout.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The body was not the JSON we expected.
    #[error("failed to decode API response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RateLimited { .. } => Some(429),
            ApiError::ApiError { status, .. } => Some(*status),
            ApiError::NetworkError(err) => err.status().map(|s| s.as_u16()),
            ApiError::Decode(_) => None,
        }
    }
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } => true,
            ApiError::ApiError { status, .. } => *status >= 500 || *status == 408,
            ApiError::NetworkError(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            ApiError::Decode(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after_ms } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> ApiError {
        ApiError::ApiError {
            status,
            message: "boom".into(),
        }
    }

    #[test]
    fn rate_limited_display() {
        let err = ApiError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn api_error_display() {
        let err = ApiError::ApiError {
            status: 401,
            message: "Invalid token".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid token");
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(api(500).is_retryable());
        assert!(api(503).is_retryable());
        assert!(ApiError::RateLimited { retry_after_ms: 10 }.is_retryable());
    }

    #[test]
    fn auth_validation_and_not_found_are_not_retryable() {
        assert!(!api(401).is_retryable());
        assert!(!api(403).is_retryable());
        assert!(!api(404).is_retryable());
        assert!(!api(422).is_retryable());
        assert!(!ApiError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn rate_limit_carries_suggested_delay() {
        let err = ApiError::RateLimited {
            retry_after_ms: 3000,
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(api(500).retry_after(), None);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ApiError>();
    }
}
