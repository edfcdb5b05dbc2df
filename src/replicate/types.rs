//! Request bodies for the predictions API.
//!
//! Responses are [`Job`](crate::state_machine::Job) snapshots.

use serde::{Deserialize, Serialize};

/// Body of `POST /predictions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePrediction {
    /// Model version identifier.
    pub version: String,
    /// Model inputs, passed through untouched.
    pub input: serde_json::Value,
    /// Callback URL the remote service itself should call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhook_events_filter: Vec<String>,
}

impl CreatePrediction {
    pub fn new(version: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            version: version.into(),
            input,
            webhook: None,
            webhook_events_filter: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let req = CreatePrediction::new("v1", serde_json::json!({"prompt": "a cat"}));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["version"], "v1");
        assert_eq!(json["input"]["prompt"], "a cat");
        assert!(json.get("webhook").is_none());
        assert!(json.get("webhook_events_filter").is_none());
    }
}
