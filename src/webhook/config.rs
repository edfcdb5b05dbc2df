use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::error::WebhookError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const MIN_SECRET_LEN: usize = 32;
const MIN_TIMEOUT_MS: i64 = 1_000;

/// A webhook registration as the caller supplies it. Unset fields fall back
/// to the defaults when the delivery is queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Validates and merges the defaults in.
    pub fn resolve(&self) -> Result<DeliveryTarget, WebhookError> {
        let problems = validate_webhook_config(self);
        if !problems.is_empty() {
            return Err(WebhookError::Validation(problems));
        }
        let url = Url::parse(&self.url).map_err(|e| WebhookError::Validation(vec![e.to_string()]))?;
        let max_retries = self
            .max_retries
            .map_or(DEFAULT_MAX_RETRIES, |n| u32::try_from(n).unwrap_or(u32::MAX));
        let timeout_ms = self
            .timeout_ms
            .map_or(DEFAULT_TIMEOUT_MS, |ms| ms.unsigned_abs());
        Ok(DeliveryTarget {
            url,
            secret: self.secret.clone(),
            max_retries,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

/// Everything wrong with `config`; empty when it is usable.
pub fn validate_webhook_config(config: &WebhookConfig) -> Vec<String> {
    let mut problems = Vec::new();

    if let Err(err) = Url::parse(&config.url) {
        problems.push(format!("url must be an absolute URL ({err})"));
    }
    if let Some(secret) = &config.secret
        && secret.chars().count() < MIN_SECRET_LEN
    {
        problems.push(format!(
            "secret must be at least {MIN_SECRET_LEN} characters"
        ));
    }
    if let Some(retries) = config.max_retries
        && retries < 0
    {
        problems.push("retries must be a non-negative integer".to_string());
    }
    if let Some(timeout) = config.timeout_ms
        && timeout < MIN_TIMEOUT_MS
    {
        problems.push(format!("timeout must be at least {MIN_TIMEOUT_MS}ms"));
    }

    problems
}

/// A validated registration, fixed for the lifetime of one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTarget {
    pub url: Url,
    pub secret: Option<String>,
    pub max_retries: u32,
    pub timeout: Duration,
}

/// The body of every webhook request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl WebhookEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}
