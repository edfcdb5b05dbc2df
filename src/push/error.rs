use thiserror::Error;

use super::ConnectionId;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open push connection: {0}")]
    Connect(String),

    #[error("push connection closed")]
    Closed,

    #[error("push connection I/O error: {0}")]
    Io(String),

    #[error("push endpoint returned status {0}")]
    Status(u16),

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid push endpoint: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}
