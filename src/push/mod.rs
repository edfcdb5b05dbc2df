//! Server-push delivery of prediction events to live subscribers.

mod error;
pub mod http;
pub mod link;
mod transport;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use error::TransportError;
pub use http::{HttpConnector, HttpLink};
pub use link::{ChannelConnector, ChannelLink, ChannelPeer, Connector, Link};
pub use transport::{ConnectionState, PushTransport, TransportConfig, TransportEvent};

/// Logical identity of a push connection. It survives reconnects, so
/// subscriptions made under it keep receiving notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
