//! The seam between the transport and whatever carries its frames.
//!
//! A [`Connector`] opens one [`Link`] per logical connection. The transport
//! only ever sees text frames; framing and I/O live behind the trait.
//! [`ChannelConnector`] is the in-process implementation: every opened link
//! surfaces a [`ChannelPeer`] that plays the remote side.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;

use super::ConnectionId;
use super::error::TransportError;

pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    fn open(
        &self,
        connection_id: &ConnectionId,
    ) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

pub trait Link: Send + 'static {
    fn send(&mut self, frame: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound frame. `None` means the remote side hung up.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens in-memory links and hands the far ends to whoever holds the
/// receiver returned by [`ChannelConnector::new`].
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    peers: mpsc::UnboundedSender<ChannelPeer>,
    refusals: Arc<AtomicU32>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refusals: Arc::new(AtomicU32::new(0)),
            },
            rx,
        )
    }

    /// Makes the next `count` opens fail, simulating an unreachable peer.
    pub fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    fn take_refusal(&self) -> bool {
        self.refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Connector for ChannelConnector {
    type Link = ChannelLink;

    async fn open(&self, connection_id: &ConnectionId) -> Result<ChannelLink, TransportError> {
        if self.take_refusal() {
            return Err(TransportError::Connect(format!(
                "peer refused connection {connection_id}"
            )));
        }
        let (to_peer, from_relay) = mpsc::unbounded_channel();
        let (to_relay, from_peer) = mpsc::unbounded_channel();
        let peer = ChannelPeer {
            connection_id: connection_id.clone(),
            frames: from_relay,
            replies: to_relay,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("no peer is listening".into()))?;
        Ok(ChannelLink {
            outbound: Some(to_peer),
            inbound: from_peer,
        })
    }
}

#[derive(Debug)]
pub struct ChannelLink {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

impl Link for ChannelLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

/// The remote end of a [`ChannelLink`]. Dropping it hangs up the link.
#[derive(Debug)]
pub struct ChannelPeer {
    pub connection_id: ConnectionId,
    frames: mpsc::UnboundedReceiver<String>,
    replies: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl ChannelPeer {
    /// Waits for the next frame; `None` once the relay closed the link.
    pub async fn recv(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.frames.try_recv().ok()
    }

    /// Everything received so far, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.replies.send(Ok(frame.into())).is_ok()
    }

    /// Breaks the link with a transport error.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.replies
            .send(Err(TransportError::Io(message.into())))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, mut peers) = ChannelConnector::new();
        let mut link = connector.open(&ConnectionId::from("c1")).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.connection_id.as_str(), "c1");

        link.send("hello".into()).await.unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));

        assert!(peer.send("world"));
        assert_eq!(link.recv().await.unwrap().unwrap(), "world");
    }

    #[tokio::test]
    async fn dropping_the_peer_hangs_up() {
        let (connector, mut peers) = ChannelConnector::new();
        let mut link = connector.open(&ConnectionId::from("c1")).await.unwrap();
        drop(peers.recv().await.unwrap());
        assert!(link.recv().await.is_none());
        assert!(link.send("late".into()).await.is_err());
    }

    #[tokio::test]
    async fn refusals_are_consumed_one_open_at_a_time() {
        let (connector, _peers) = ChannelConnector::new();
        connector.refuse_next(2);
        let id = ConnectionId::from("c1");
        assert!(connector.open(&id).await.is_err());
        assert!(connector.open(&id).await.is_err());
        assert!(connector.open(&id).await.is_ok());
    }

    #[tokio::test]
    async fn closed_link_rejects_sends() {
        let (connector, mut peers) = ChannelConnector::new();
        let mut link = connector.open(&ConnectionId::from("c1")).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        link.close().await;
        assert!(matches!(link.send("x".into()).await, Err(TransportError::Closed)));
        assert_eq!(peer.recv().await, None);
    }
}
