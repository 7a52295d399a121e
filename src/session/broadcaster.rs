//! Live push connections and revocation fan-out.
//!
//! Connections are process-local: a revocation issued on one instance only
//! reaches clients connected to that same instance.
//!
//! Each connection is a bounded channel feeding one SSE stream, plus a
//! heartbeat task that pings on a fixed interval. The heartbeat task owns the
//! connection's lifecycle: it exits when the client goes away (the receiving
//! half is dropped), when a ping cannot be delivered, or when the broadcaster
//! shuts down, and unregisters the connection on the way out. A client that
//! stops draining its stream parks the heartbeat on a full buffer, but
//! shutdown still ends it.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, error::SendTimeoutError},
        Mutex,
    },
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const CONNECTION_BUFFER: usize = 16;
/// How long `notify` waits for room in a full connection buffer.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONNECTED_MESSAGE: &str = "Connected to session events";
pub const REVOKED_MESSAGE: &str = "Your session was terminated by an administrator";

pub type ConnectionId = u64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectedPayload {
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PingPayload {
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RevokedPayload {
    pub revoked: bool,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Server to client push messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Connected(ConnectedPayload),
    Ping(PingPayload),
    SessionRevoked(RevokedPayload),
}

impl SessionEvent {
    #[must_use]
    pub fn connected() -> Self {
        Self::Connected(ConnectedPayload {
            message: CONNECTED_MESSAGE.to_string(),
        })
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::Ping(PingPayload {
            timestamp: Utc::now(),
        })
    }

    #[must_use]
    pub fn session_revoked(message: &str) -> Self {
        Self::SessionRevoked(RevokedPayload {
            revoked: true,
            timestamp: Utc::now(),
            message: message.to_string(),
        })
    }

    /// SSE `event:` name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Ping(_) => "ping",
            Self::SessionRevoked(_) => "session_revoked",
        }
    }

    /// SSE `data:` payload.
    ///
    /// # Errors
    /// Returns an error if the payload cannot be serialized.
    pub fn data(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Connected(payload) => serde_json::to_string(payload),
            Self::Ping(payload) => serde_json::to_string(payload),
            Self::SessionRevoked(payload) => serde_json::to_string(payload),
        }
    }
}

#[derive(Debug)]
struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<SessionEvent>,
}

/// An open push connection handed to the transport layer.
#[derive(Debug)]
pub struct Subscription {
    pub id: ConnectionId,
    pub user_id: Uuid,
    pub receiver: mpsc::Receiver<SessionEvent>,
}

#[derive(Debug)]
pub struct RevocationBroadcaster {
    connections: Mutex<HashMap<Uuid, Vec<Connection>>>,
    next_id: AtomicU64,
    ping_interval: Duration,
    shutdown: CancellationToken,
}

impl Default for RevocationBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL)
    }
}

impl RevocationBroadcaster {
    #[must_use]
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ping_interval,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Add a connection for `user_id`. An identity may hold any number of
    /// connections at once.
    pub async fn register(&self, user_id: Uuid, sender: mpsc::Sender<SessionEvent>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.lock().await;
        connections
            .entry(user_id)
            .or_default()
            .push(Connection { id, sender });
        debug!(%user_id, connection_id = id, "session events connection registered");
        id
    }

    /// Remove a connection, dropping the identity entry once it is empty.
    /// Returns `false` if the connection was not registered.
    pub async fn unregister(&self, user_id: Uuid, id: ConnectionId) -> bool {
        let mut connections = self.connections.lock().await;
        let Some(entries) = connections.get_mut(&user_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|connection| connection.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            connections.remove(&user_id);
        }
        if removed {
            debug!(%user_id, connection_id = id, "session events connection unregistered");
        }
        removed
    }

    /// Push `event` to every connection of `user_id`.
    ///
    /// Works on a snapshot of the connection set, so the lock is not held
    /// while sending. Connections are written concurrently: a closed one is
    /// skipped at once, a full one gets up to [`DELIVERY_TIMEOUT`] to make
    /// room, and neither delays the others. Returns the number of
    /// connections reached.
    pub async fn notify(&self, user_id: Uuid, event: SessionEvent) -> usize {
        let senders: Vec<(ConnectionId, mpsc::Sender<SessionEvent>)> = {
            let connections = self.connections.lock().await;
            match connections.get(&user_id) {
                Some(entries) => entries
                    .iter()
                    .map(|connection| (connection.id, connection.sender.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let sends = senders.into_iter().map(|(id, sender)| {
            let event = event.clone();
            async move {
                match sender.send_timeout(event, DELIVERY_TIMEOUT).await {
                    Ok(()) => true,
                    Err(SendTimeoutError::Timeout(_)) => {
                        debug!(%user_id, connection_id = id, "connection buffer stayed full");
                        false
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        debug!(%user_id, connection_id = id, "skipping closed connection");
                        false
                    }
                }
            }
        });
        let delivered = join_all(sends).await.into_iter().filter(|sent| *sent).count();
        info!(%user_id, event = event.name(), delivered, "session event pushed");
        delivered
    }

    /// Open a connection: register it, queue the `connected` greeting and
    /// start its heartbeat.
    pub async fn connect(self: &Arc<Self>, user_id: Uuid) -> Subscription {
        let (sender, receiver) = mpsc::channel(CONNECTION_BUFFER);
        if let Err(err) = sender.try_send(SessionEvent::connected()) {
            debug!(%user_id, "failed to queue greeting: {err}");
        }
        let id = self.register(user_id, sender.clone()).await;
        self.spawn_heartbeat(user_id, id, sender);
        info!(%user_id, connection_id = id, "session events connection established");
        Subscription {
            id,
            user_id,
            receiver,
        }
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.connections.lock().await.contains_key(&user_id)
    }

    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.connections
            .lock()
            .await
            .get(&user_id)
            .map_or(0, Vec::len)
    }

    pub async fn connected_users(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Stop every heartbeat task. Their connections are unregistered, which
    /// drops the last senders and ends the streams.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        user_id: Uuid,
        id: ConnectionId,
        sender: mpsc::Sender<SessionEvent>,
    ) {
        let broadcaster = Arc::clone(self);
        let shutdown = self.shutdown.child_token();
        let period = self.ping_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = sender.closed() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            sent = sender.send(SessionEvent::ping()) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            drop(sender);
            broadcaster.unregister(user_id, id).await;
            debug!(%user_id, connection_id = id, "session events heartbeat stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_unregister_drop_empty_entries() {
        let broadcaster = RevocationBroadcaster::default();
        let user_id = Uuid::new_v4();
        let (tx_a, _rx_a) = mpsc::channel(1);
        let (tx_b, _rx_b) = mpsc::channel(1);

        let a = broadcaster.register(user_id, tx_a).await;
        let b = broadcaster.register(user_id, tx_b).await;
        assert_ne!(a, b);
        assert_eq!(broadcaster.connection_count(user_id).await, 2);

        assert!(broadcaster.unregister(user_id, a).await);
        assert!(broadcaster.is_connected(user_id).await);
        assert!(broadcaster.unregister(user_id, b).await);
        assert!(!broadcaster.is_connected(user_id).await);
        assert!(!broadcaster.unregister(user_id, b).await);
        assert_eq!(broadcaster.connected_users().await, 0);
    }

    #[tokio::test]
    async fn notify_skips_dead_connections() {
        let broadcaster = RevocationBroadcaster::default();
        let user_id = Uuid::new_v4();
        let (tx_dead, rx_dead) = mpsc::channel(1);
        let (tx_live, mut rx_live) = mpsc::channel(1);
        broadcaster.register(user_id, tx_dead).await;
        broadcaster.register(user_id, tx_live).await;
        drop(rx_dead);

        let delivered = broadcaster
            .notify(user_id, SessionEvent::session_revoked(REVOKED_MESSAGE))
            .await;
        assert_eq!(delivered, 1);
        let event = rx_live.recv().await.expect("event");
        assert_eq!(event.name(), "session_revoked");
    }

    #[tokio::test]
    async fn notify_waits_for_room_in_a_full_buffer() {
        let broadcaster = RevocationBroadcaster::default();
        let user_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(CONNECTION_BUFFER);
        for _ in 0..CONNECTION_BUFFER {
            tx.try_send(SessionEvent::ping()).expect("room");
        }
        broadcaster.register(user_id, tx).await;

        let notify = broadcaster.notify(user_id, SessionEvent::session_revoked(REVOKED_MESSAGE));
        let drain = async {
            let mut names = Vec::new();
            while let Some(event) = rx.recv().await {
                names.push(event.name());
                if names.len() > CONNECTION_BUFFER {
                    break;
                }
            }
            names
        };
        let (delivered, names) = tokio::join!(notify, drain);
        assert_eq!(delivered, 1);
        assert_eq!(names.last(), Some(&"session_revoked"));
    }

    #[tokio::test]
    async fn shutdown_stops_a_heartbeat_stuck_on_a_full_buffer() {
        let broadcaster = Arc::new(RevocationBroadcaster::new(Duration::from_millis(5)));
        let user_id = Uuid::new_v4();
        let subscription = broadcaster.connect(user_id).await;

        // Never drained: the buffer fills and the heartbeat parks on send.
        tokio::time::timeout(Duration::from_secs(2), async {
            while subscription.receiver.len() < CONNECTION_BUFFER {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("buffer never filled");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broadcaster.is_connected(user_id).await);

        broadcaster.shutdown();
        tokio::time::timeout(Duration::from_secs(2), async {
            while broadcaster.is_connected(user_id).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("heartbeat still registered after shutdown");
    }

    #[tokio::test]
    async fn notify_unknown_identity_is_a_noop() {
        let broadcaster = RevocationBroadcaster::default();
        assert_eq!(
            broadcaster
                .notify(Uuid::new_v4(), SessionEvent::ping())
                .await,
            0
        );
    }

    #[test]
    fn event_payload_shapes() {
        let revoked = SessionEvent::session_revoked("bye");
        let data: serde_json::Value =
            serde_json::from_str(&revoked.data().expect("data")).expect("json");
        assert_eq!(data["revoked"], true);
        assert_eq!(data["message"], "bye");
        assert!(data["timestamp"].is_string());

        let connected: serde_json::Value =
            serde_json::from_str(&SessionEvent::connected().data().expect("data")).expect("json");
        assert_eq!(connected["message"], CONNECTED_MESSAGE);

        let ping: serde_json::Value =
            serde_json::from_str(&SessionEvent::ping().data().expect("data")).expect("json");
        assert!(ping["timestamp"].is_string());
        assert_eq!(SessionEvent::ping().name(), "ping");
    }
}
