use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ConnectionId;
use super::error::TransportError;
use super::link::{Connector, Link};
use crate::events::{
    INVALID_PARAMS, Incoming, METHOD_HEARTBEAT, METHOD_NOT_FOUND, METHOD_PING,
    METHOD_SESSION_CLOSED, METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE, Notification, RelayEvent,
    Request, Response,
};
use crate::retry::RetryPolicy;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Idle time after which a heartbeat frame is sent.
    pub keep_alive: Duration,
    /// Reconnect schedule; `max_attempts` is the ceiling per outage.
    pub reconnect: RetryPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            reconnect: RetryPolicy {
                max_attempts: 5,
                min_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                backoff_factor: 2.0,
                jitter: false,
            },
        }
    }
}

/// Lifecycle notices for whoever owns the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected(ConnectionId),
    Reconnecting {
        id: ConnectionId,
        attempt: u32,
        delay: Duration,
    },
    Reconnected(ConnectionId),
    /// One connection was closed on request.
    Closed(ConnectionId),
    /// `disconnect()` finished and no connection remains.
    Disconnected,
    /// Reconnection gave up; the connection is gone for good.
    Error { id: ConnectionId, message: String },
}

struct Entry {
    state: ConnectionState,
    reconnect_attempts: u32,
    subscriptions: HashSet<String>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    connections: Mutex<HashMap<ConnectionId, Entry>>,
    no_reconnect: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    config: TransportConfig,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_entry<R>(&self, id: &ConnectionId, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        self.table().get_mut(id).map(f)
    }

    fn emit(&self, event: TransportEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn reconnect_suppressed(&self) -> bool {
        self.no_reconnect.load(Ordering::SeqCst)
    }
}

/// Owns every push connection and its subscriptions.
///
/// Delivery is best-effort and at-most-once per connection: frames only go
/// to connections that are `Open` at the moment of the call, and nothing is
/// replayed after a reconnect.
pub struct PushTransport<C> {
    connector: Arc<C>,
    shared: Arc<Shared>,
}

impl<C: Connector> PushTransport<C> {
    pub fn new(connector: C, config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector: Arc::new(connector),
            shared: Arc::new(Shared {
                connections: Mutex::new(HashMap::new()),
                no_reconnect: AtomicBool::new(false),
                events,
                config,
            }),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Opens a new connection and starts its keep-alive.
    pub async fn connect(&self) -> Result<ConnectionId, TransportError> {
        self.shared.no_reconnect.store(false, Ordering::SeqCst);

        let id = ConnectionId::generate();
        let (outbound, frames) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.shared.table().insert(
            id.clone(),
            Entry {
                state: ConnectionState::Connecting,
                reconnect_attempts: 0,
                subscriptions: HashSet::new(),
                outbound,
                cancel: cancel.clone(),
                task: None,
            },
        );

        let opened = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Closed),
            result = self.connector.open(&id) => result,
        };
        let mut link = match opened {
            Ok(link) => link,
            Err(err) => {
                self.shared.table().remove(&id);
                warn!(connection_id = %id, error = %err, "push connection failed to open");
                return Err(err);
            }
        };

        // disconnect() may have torn the entry down while we were opening.
        let still_wanted = self
            .shared
            .with_entry(&id, |entry| entry.state = ConnectionState::Open)
            .is_some();
        if !still_wanted {
            link.close().await;
            return Err(TransportError::Closed);
        }

        let task = tokio::spawn(drive(
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            id.clone(),
            link,
            frames,
            cancel,
        ));
        self.shared.with_entry(&id, |entry| entry.task = Some(task));

        info!(connection_id = %id, "push connection open");
        self.shared.emit(TransportEvent::Connected(id.clone()));
        Ok(id)
    }

    /// Closes every connection without reconnecting. Safe to call repeatedly;
    /// only a call that actually closed something emits `Disconnected`.
    pub async fn disconnect(&self) {
        self.shared.no_reconnect.store(true, Ordering::SeqCst);

        let entries: Vec<(ConnectionId, Entry)> = self.shared.table().drain().collect();
        if entries.is_empty() {
            debug!("disconnect: no push connections");
            return;
        }

        let farewell = session_closed_frame("disconnect");
        let count = entries.len();
        let mut tasks = Vec::with_capacity(count);
        for (id, entry) in entries {
            if entry.state == ConnectionState::Open
                && let Some(frame) = &farewell
            {
                let _ = entry.outbound.send(frame.clone());
            }
            entry.cancel.cancel();
            tasks.extend(entry.task);
            debug!(connection_id = %id, "closing push connection");
        }
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "push connection task ended abnormally");
            }
        }

        info!(count, "push transport disconnected");
        self.shared.emit(TransportEvent::Disconnected);
    }

    /// Closes one connection on request; it is not reconnected.
    pub async fn close(&self, id: &ConnectionId) -> bool {
        let Some(entry) = self.shared.table().remove(id) else {
            return false;
        };
        if entry.state == ConnectionState::Open
            && let Some(frame) = session_closed_frame("closed")
        {
            let _ = entry.outbound.send(frame);
        }
        entry.cancel.cancel();
        if let Some(task) = entry.task
            && let Err(err) = task.await
        {
            warn!(connection_id = %id, error = %err, "push connection task ended abnormally");
        }
        self.shared.emit(TransportEvent::Closed(id.clone()));
        true
    }

    /// Broadcasts a raw frame to every open connection.
    pub fn send(&self, message: &str) -> usize {
        self.shared
            .table()
            .values()
            .filter(|entry| entry.state == ConnectionState::Open)
            .filter(|entry| entry.outbound.send(message.to_string()).is_ok())
            .count()
    }

    pub fn subscribe(&self, id: &ConnectionId, uri: &str) -> Result<bool, TransportError> {
        self.shared
            .with_entry(id, |entry| entry.subscriptions.insert(uri.to_string()))
            .ok_or_else(|| TransportError::UnknownConnection(id.clone()))
    }

    pub fn unsubscribe(&self, id: &ConnectionId, uri: &str) -> Result<bool, TransportError> {
        self.shared
            .with_entry(id, |entry| entry.subscriptions.remove(uri))
            .ok_or_else(|| TransportError::UnknownConnection(id.clone()))
    }

    /// Delivers `event` to open connections subscribed to its resource.
    /// Returns how many connections it was handed to.
    pub fn notify(&self, event: &RelayEvent) -> usize {
        self.publish(&event.resource_uri(), &event.to_notification())
    }

    pub fn publish(&self, uri: &str, notification: &Notification) -> usize {
        let frame = match serde_json::to_string(notification) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode notification");
                return 0;
            }
        };
        let delivered = self
            .shared
            .table()
            .values()
            .filter(|entry| {
                entry.state == ConnectionState::Open && entry.subscriptions.contains(uri)
            })
            .filter(|entry| entry.outbound.send(frame.clone()).is_ok())
            .count();
        debug!(uri, method = %notification.method, delivered, "published notification");
        delivered
    }

    pub fn connection_state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.shared.table().get(id).map(|entry| entry.state)
    }

    pub fn reconnect_attempts(&self, id: &ConnectionId) -> Option<u32> {
        self.shared.table().get(id).map(|entry| entry.reconnect_attempts)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.shared.table().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscriptions(&self, id: &ConnectionId) -> Option<Vec<String>> {
        self.shared.table().get(id).map(|entry| {
            let mut uris: Vec<_> = entry.subscriptions.iter().cloned().collect();
            uris.sort();
            uris
        })
    }

    pub fn open_count(&self) -> usize {
        self.shared
            .table()
            .values()
            .filter(|entry| entry.state == ConnectionState::Open)
            .count()
    }
}

impl<C> Drop for PushTransport<C> {
    fn drop(&mut self) {
        self.shared.no_reconnect.store(true, Ordering::SeqCst);
        for entry in self.shared.table().values() {
            entry.cancel.cancel();
        }
    }
}

fn session_closed_frame(reason: &str) -> Option<String> {
    let notification = Notification::new(METHOD_SESSION_CLOSED, json!({ "reason": reason }));
    serde_json::to_string(&notification).ok()
}

fn heartbeat_frame() -> String {
    json!({ "jsonrpc": "2.0", "method": METHOD_HEARTBEAT }).to_string()
}

enum Exit {
    Cancelled,
    Failed(TransportError),
}

/// Runs one logical connection: pump frames while open, and on failure walk
/// the reconnect loop until a fresh link is up or we give up.
async fn drive<C: Connector>(
    shared: Arc<Shared>,
    connector: Arc<C>,
    id: ConnectionId,
    mut link: C::Link,
    mut frames: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        match pump(&shared, &id, &mut link, &mut frames, &cancel).await {
            Exit::Cancelled => {
                // Flush what was queued before the close, e.g. session/closed.
                while let Ok(frame) = frames.try_recv() {
                    if link.send(frame).await.is_err() {
                        break;
                    }
                }
                link.close().await;
                debug!(connection_id = %id, "push connection closed");
                return;
            }
            Exit::Failed(err) => {
                warn!(connection_id = %id, error = %err, "push connection failed");
                link.close().await;
                shared.with_entry(&id, |entry| entry.state = ConnectionState::Closed);
                // Frames queued for the dead link are not replayed.
                while frames.try_recv().is_ok() {}
            }
        }

        match reconnect(&shared, connector.as_ref(), &id, &cancel).await {
            Some(fresh) => link = fresh,
            None => return,
        }
    }
}

async fn pump<L: Link>(
    shared: &Shared,
    id: &ConnectionId,
    link: &mut L,
    frames: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> Exit {
    let keep_alive = shared.config.keep_alive;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Exit::Cancelled,
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    return Exit::Cancelled;
                };
                if let Err(err) = link.send(frame).await {
                    return Exit::Failed(err);
                }
                heartbeat.reset();
            }
            _ = heartbeat.tick() => {
                debug!(connection_id = %id, "sending heartbeat");
                if let Err(err) = link.send(heartbeat_frame()).await {
                    return Exit::Failed(err);
                }
            }
            inbound = link.recv() => match inbound {
                None => return Exit::Failed(TransportError::Closed),
                Some(Err(err)) => return Exit::Failed(err),
                Some(Ok(frame)) => {
                    if let Some(reply) = handle_frame(shared, id, &frame)
                        && let Err(err) = link.send(reply).await
                    {
                        return Exit::Failed(err);
                    }
                }
            },
        }
    }
}

/// Explicit reconnect state loop: `Closed → (wait) → Connecting → Open`, or
/// give up after the configured number of attempts.
async fn reconnect<C: Connector>(
    shared: &Shared,
    connector: &C,
    id: &ConnectionId,
    cancel: &CancellationToken,
) -> Option<C::Link> {
    let policy = &shared.config.reconnect;
    let mut attempt = 0;

    loop {
        if shared.reconnect_suppressed() || cancel.is_cancelled() {
            return None;
        }
        if attempt >= policy.max_attempts {
            let message = format!("gave up reconnecting after {attempt} attempts");
            error!(connection_id = %id, "{message}");
            // Permanent close drops the subscriptions with the connection.
            if shared.table().remove(id).is_some() {
                shared.emit(TransportEvent::Error {
                    id: id.clone(),
                    message,
                });
            }
            return None;
        }

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        if shared
            .with_entry(id, |entry| entry.reconnect_attempts = attempt)
            .is_none()
        {
            return None;
        }
        info!(connection_id = %id, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        shared.emit(TransportEvent::Reconnecting {
            id: id.clone(),
            attempt,
            delay,
        });

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        if shared.reconnect_suppressed() {
            return None;
        }

        shared.with_entry(id, |entry| entry.state = ConnectionState::Connecting);
        let opened = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = connector.open(id) => result,
        };
        match opened {
            Ok(mut link) => {
                let reopened = shared
                    .with_entry(id, |entry| {
                        entry.state = ConnectionState::Open;
                        entry.reconnect_attempts = 0;
                    })
                    .is_some();
                if !reopened {
                    link.close().await;
                    return None;
                }
                info!(connection_id = %id, attempt, "push connection re-established");
                shared.emit(TransportEvent::Reconnected(id.clone()));
                return Some(link);
            }
            Err(err) => {
                warn!(connection_id = %id, attempt, error = %err, "reconnect attempt failed");
                shared.with_entry(id, |entry| entry.state = ConnectionState::Closed);
            }
        }
    }
}

/// Answers control requests from the peer. Malformed frames are logged and
/// dropped; they never close the connection.
fn handle_frame(shared: &Shared, id: &ConnectionId, frame: &str) -> Option<String> {
    let incoming = match Incoming::parse(frame) {
        Ok(incoming) => incoming,
        Err(err) => {
            warn!(connection_id = %id, error = %err, "ignoring malformed frame");
            return None;
        }
    };
    match incoming {
        Incoming::Request(request) => serde_json::to_string(&answer(shared, id, request)).ok(),
        Incoming::Notification(notification) => {
            debug!(connection_id = %id, method = %notification.method, "notification from peer");
            None
        }
        Incoming::Response(response) => {
            debug!(connection_id = %id, response_id = %response.id, "response from peer");
            None
        }
    }
}

fn answer(shared: &Shared, id: &ConnectionId, request: Request) -> Response {
    match request.method.as_str() {
        METHOD_PING => Response::ok(request.id, json!({})),
        METHOD_SUBSCRIBE | METHOD_UNSUBSCRIBE => {
            let Some(uri) = request.params.get("uri").and_then(Value::as_str) else {
                return Response::err(request.id, INVALID_PARAMS, "missing params.uri");
            };
            let subscribe = request.method == METHOD_SUBSCRIBE;
            let applied = shared.with_entry(id, |entry| {
                if subscribe {
                    entry.subscriptions.insert(uri.to_string());
                } else {
                    entry.subscriptions.remove(uri);
                }
            });
            match applied {
                Some(()) => Response::ok(request.id, json!({})),
                None => Response::err(request.id, INVALID_PARAMS, "connection is closed"),
            }
        }
        other => Response::err(
            request.id,
            METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::link::{ChannelConnector, ChannelPeer};
    use crate::state_machine::{JobStatus, StatusTransition};
    use chrono::Utc;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        transport: PushTransport<ChannelConnector>,
        connector: ChannelConnector,
        peers: UnboundedReceiver<ChannelPeer>,
        events: broadcast::Receiver<TransportEvent>,
    }

    fn harness() -> Harness {
        let (connector, peers) = ChannelConnector::new();
        let transport = PushTransport::new(connector.clone(), TransportConfig::default());
        let events = transport.events();
        Harness {
            transport,
            connector,
            peers,
            events,
        }
    }

    impl Harness {
        async fn open(&mut self) -> (ConnectionId, ChannelPeer) {
            let id = self.transport.connect().await.unwrap();
            let peer = self.peers.recv().await.unwrap();
            assert_eq!(peer.connection_id, id);
            assert_eq!(self.events.recv().await.unwrap(), TransportEvent::Connected(id.clone()));
            (id, peer)
        }
    }

    fn status_event(job_id: &str) -> RelayEvent {
        RelayEvent::Status(StatusTransition {
            job_id: job_id.into(),
            from: JobStatus::Starting,
            to: JobStatus::Processing,
            timestamp: Utc::now(),
        })
    }

    fn method_of(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).unwrap();
        value["method"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn notify_reaches_only_subscribers_of_the_resource() {
        let mut h = harness();
        let (a, mut peer_a) = h.open().await;
        let (_b, mut peer_b) = h.open().await;

        assert!(h.transport.subscribe(&a, "job://1").unwrap());
        let note = Notification::new("prediction/status", json!({"id": 1}));

        assert_eq!(h.transport.publish("job://1", &note), 1);
        assert_eq!(method_of(&peer_a.recv().await.unwrap()), "prediction/status");
        assert_eq!(h.transport.publish("job://2", &note), 0);

        tokio::task::yield_now().await;
        assert!(peer_a.drain().is_empty());
        assert!(peer_b.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notify_uses_the_prediction_resource_uri() {
        let mut h = harness();
        let (a, mut peer) = h.open().await;
        h.transport.subscribe(&a, "prediction://pred_1").unwrap();

        assert_eq!(h.transport.notify(&status_event("pred_1")), 1);
        assert_eq!(h.transport.notify(&status_event("pred_2")), 0);
        let frame: Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(frame["params"]["predictionId"], "pred_1");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_everything_once() {
        let mut h = harness();
        let (a, mut peer_a) = h.open().await;
        let (_b, mut peer_b) = h.open().await;
        h.transport.subscribe(&a, "job://1").unwrap();

        h.transport.disconnect().await;

        assert_eq!(method_of(&peer_a.recv().await.unwrap()), METHOD_SESSION_CLOSED);
        assert_eq!(peer_a.recv().await, None);
        assert_eq!(method_of(&peer_b.recv().await.unwrap()), METHOD_SESSION_CLOSED);
        assert_eq!(h.events.recv().await.unwrap(), TransportEvent::Disconnected);
        assert!(h.transport.connection_ids().is_empty());
        assert_eq!(h.transport.subscriptions(&a), None);

        let note = Notification::new("prediction/status", Value::Null);
        assert_eq!(h.transport.publish("job://1", &note), 0);

        h.transport.disconnect().await;
        assert!(matches!(
            h.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_broadcasts_to_open_connections() {
        let mut h = harness();
        let (_a, mut peer_a) = h.open().await;
        let (_b, mut peer_b) = h.open().await;

        assert_eq!(h.transport.send("raw"), 2);
        assert_eq!(peer_a.recv().await.as_deref(), Some("raw"));
        assert_eq!(peer_b.recv().await.as_deref(), Some("raw"));
        assert_eq!(h.transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_get_heartbeats() {
        let mut h = harness();
        let (_a, mut peer) = h.open().await;

        let started = Instant::now();
        let frame = peer.recv().await.unwrap();
        assert_eq!(method_of(&frame), METHOD_HEARTBEAT);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_keeps_identity_and_subscriptions() {
        let mut h = harness();
        let (a, peer) = h.open().await;
        h.transport.subscribe(&a, "prediction://pred_1").unwrap();

        drop(peer);
        assert_eq!(
            h.events.recv().await.unwrap(),
            TransportEvent::Reconnecting {
                id: a.clone(),
                attempt: 1,
                delay: Duration::from_secs(1),
            }
        );
        assert_eq!(h.transport.notify(&status_event("pred_1")), 0);

        let mut fresh = h.peers.recv().await.unwrap();
        assert_eq!(fresh.connection_id, a);
        assert_eq!(h.events.recv().await.unwrap(), TransportEvent::Reconnected(a.clone()));
        assert_eq!(h.transport.connection_state(&a), Some(ConnectionState::Open));
        assert_eq!(h.transport.reconnect_attempts(&a), Some(0));

        assert_eq!(h.transport.notify(&status_event("pred_1")), 1);
        assert_eq!(method_of(&fresh.recv().await.unwrap()), "prediction/status");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_ceiling() {
        let mut h = harness();
        let (a, peer) = h.open().await;
        h.connector.refuse_next(u32::MAX);

        assert!(peer.fail("connection reset"));
        let mut delays = Vec::new();
        loop {
            match h.events.recv().await.unwrap() {
                TransportEvent::Reconnecting { attempt, delay, .. } => {
                    assert_eq!(attempt as usize, delays.len() + 1);
                    delays.push(delay.as_secs());
                }
                TransportEvent::Error { id, message } => {
                    assert_eq!(id, a);
                    assert!(message.contains("5 attempts"));
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(h.transport.connection_state(&a), None);
        assert!(h.transport.subscribe(&a, "job://1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_suppresses_pending_reconnect() {
        let mut h = harness();
        let (a, peer) = h.open().await;

        drop(peer);
        assert!(matches!(
            h.events.recv().await.unwrap(),
            TransportEvent::Reconnecting { .. }
        ));
        assert_eq!(h.transport.connection_state(&a), Some(ConnectionState::Closed));

        h.transport.disconnect().await;
        assert_eq!(h.events.recv().await.unwrap(), TransportEvent::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.peers.try_recv().is_err());
        assert!(matches!(
            h.events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_do_not_close_the_connection() {
        let mut h = harness();
        let (a, mut peer) = h.open().await;

        assert!(peer.send("{this is not json"));
        assert!(peer.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#));

        let reply: Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"], json!({}));
        assert_eq!(h.transport.connection_state(&a), Some(ConnectionState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn peers_manage_their_own_subscriptions() {
        let mut h = harness();
        let (a, mut peer) = h.open().await;

        peer.send(
            r#"{"jsonrpc":"2.0","id":"s1","method":"resources/subscribe","params":{"uri":"prediction://p"}}"#,
        );
        let reply: Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(reply["id"], "s1");
        assert_eq!(h.transport.subscriptions(&a).unwrap(), vec!["prediction://p"]);

        peer.send(
            r#"{"jsonrpc":"2.0","id":"s2","method":"resources/unsubscribe","params":{"uri":"prediction://p"}}"#,
        );
        peer.recv().await.unwrap();
        assert!(h.transport.subscriptions(&a).unwrap().is_empty());

        peer.send(r#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#);
        let reply: Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);

        peer.send(r#"{"jsonrpc":"2.0","id":4,"method":"resources/subscribe","params":{}}"#);
        let reply: Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_does_not_reconnect() {
        let mut h = harness();
        let (a, mut peer) = h.open().await;
        let (b, _peer_b) = h.open().await;

        assert!(h.transport.close(&a).await);
        assert_eq!(method_of(&peer.recv().await.unwrap()), METHOD_SESSION_CLOSED);
        assert_eq!(peer.recv().await, None);
        assert_eq!(h.events.recv().await.unwrap(), TransportEvent::Closed(a.clone()));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.peers.try_recv().is_err());
        assert_eq!(h.transport.connection_ids(), vec![b]);
        assert!(!h.transport.close(&a).await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_leaves_no_connection_behind() {
        let h = harness();
        h.connector.refuse_next(1);
        assert!(matches!(
            h.transport.connect().await,
            Err(TransportError::Connect(_))
        ));
        assert!(h.transport.connection_ids().is_empty());
    }
}
