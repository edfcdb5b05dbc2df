//! Domain events and the JSON-RPC 2.0 envelope used on push connections.
//!
//! Components never share tables; they hand each other these immutable
//! values instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::state_machine::{JobStatus, StatusTransition};

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_STATUS: &str = "prediction/status";
pub const METHOD_PROGRESS: &str = "prediction/progress";
pub const METHOD_ERROR: &str = "prediction/error";
pub const METHOD_SESSION_CLOSED: &str = "session/closed";

pub const METHOD_SUBSCRIBE: &str = "resources/subscribe";
pub const METHOD_UNSUBSCRIBE: &str = "resources/unsubscribe";
pub const METHOD_PING: &str = "ping";
pub const METHOD_HEARTBEAT: &str = "heartbeat";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Resource identifier subscribers use for one prediction.
pub fn resource_uri(job_id: &str) -> String {
    format!("prediction://{job_id}")
}

/// Everything the poller reports about a tracked job.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Status(StatusTransition),
    Progress {
        job_id: String,
        status: JobStatus,
        progress: u8,
        timestamp: DateTime<Utc>,
    },
    /// A job ended in `Failed` with an error message. A domain event, not a
    /// transport failure.
    Failed {
        job_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl RelayEvent {
    pub fn job_id(&self) -> &str {
        match self {
            RelayEvent::Status(t) => &t.job_id,
            RelayEvent::Progress { job_id, .. } | RelayEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn resource_uri(&self) -> String {
        resource_uri(self.job_id())
    }

    /// The push notification announcing this event.
    pub fn to_notification(&self) -> Notification {
        let uri = self.resource_uri();
        match self {
            RelayEvent::Status(t) => Notification::new(
                METHOD_STATUS,
                json!({
                    "uri": uri,
                    "predictionId": t.job_id,
                    "from": t.from,
                    "to": t.to,
                    "timestamp": t.timestamp,
                }),
            ),
            RelayEvent::Progress {
                job_id,
                status,
                progress,
                timestamp,
            } => Notification::new(
                METHOD_PROGRESS,
                json!({
                    "uri": uri,
                    "predictionId": job_id,
                    "status": status,
                    "progress": progress,
                    "timestamp": timestamp,
                }),
            ),
            RelayEvent::Failed {
                job_id,
                error,
                timestamp,
            } => Notification::new(
                METHOD_ERROR,
                json!({
                    "uri": uri,
                    "predictionId": job_id,
                    "error": error,
                    "timestamp": timestamp,
                }),
            ),
        }
    }
}

/// One-way message: no `id`, no reply expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Notification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Any frame a peer may send us.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Incoming {
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}
