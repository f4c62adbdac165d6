//! Process-wide server state: the connection table, the channel table,
//! and the event handler table, shared across every connection task via
//! `axum`'s `State` extractor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Instant;

use sente_lite_wire::{Envelope, EventVector};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::error;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ServerError;

pub type ConnId = Uuid;

/// A connection's outbound half plus the bookkeeping the heartbeat
/// sweeper and channel fanout need.
pub struct Connection {
    pub id: ConnId,
    pub opened_at: Instant,
    /// Updated on every inbound frame.
    pub last_seen: StdMutex<Instant>,
    /// Updated only on a `chsk/ws-pong` reply; this, not `last_seen`, is
    /// what the heartbeat sweeper checks.
    pub last_pong: StdMutex<Instant>,
    pub outbound: mpsc::Sender<Envelope>,
    pub subscriptions: StdMutex<HashSet<String>>,
    /// Signalled by the heartbeat sweeper to force this connection's socket
    /// closed; the per-connection task listens for it in its read loop.
    pub closer: Notify,
}

pub type ConnectionTable = Arc<RwLock<HashMap<ConnId, Arc<Connection>>>>;

/// A named pub/sub channel: its current subscriber set and, optionally, a
/// bounded ring of recently published messages replayed to new subscribers.
pub struct ChannelState {
    pub name: String,
    pub created_at: Instant,
    pub subscribers: StdMutex<HashSet<ConnId>>,
    pub retained: StdMutex<VecDeque<EventVector>>,
    pub message_count: AtomicU64,
}

pub type ChannelTable = Arc<RwLock<HashMap<String, Arc<ChannelState>>>>;

type EventHandler = Arc<dyn Fn(&ServerState, ConnId, &Envelope) + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    by_id: StdMutex<HashMap<String, Vec<EventHandler>>>,
    catch_all: StdMutex<Vec<EventHandler>>,
}

#[derive(Default)]
struct Stats {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    events_received: AtomicU64,
    events_sent: AtomicU64,
}

/// A snapshot of server-wide counters, returned by [`ServerState::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    pub connections_open: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub events_received: u64,
    pub events_sent: u64,
    pub channel_count: usize,
}

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    connections: ConnectionTable,
    channels: ChannelTable,
    handlers: Arc<HandlerTable>,
    stats: Arc<Stats>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(HandlerTable::default()),
            stats: Arc::new(Stats::default()),
        }
    }

    // -- connection table ---------------------------------------------------

    pub async fn register_connection(&self, conn: Arc<Connection>) {
        self.connections.write().await.insert(conn.id, conn);
        self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn unregister_connection(&self, id: ConnId) {
        if let Some(conn) = self.connections.write().await.remove(&id) {
            let subs: Vec<String> = conn.subscriptions.lock().unwrap().iter().cloned().collect();
            for channel in subs {
                let _ = self.unsubscribe(&channel, id).await;
            }
        }
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn connection(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn connection_ids(&self) -> Vec<ConnId> {
        self.connections.read().await.keys().copied().collect()
    }

    pub(crate) fn connections_handle(&self) -> ConnectionTable {
        Arc::clone(&self.connections)
    }

    // -- channel table --------------------------------------------------------

    pub async fn get_channel(&self, name: &str) -> Option<Arc<ChannelState>> {
        self.channels.read().await.get(name).cloned()
    }

    pub async fn get_or_create_channel(&self, name: &str) -> Arc<ChannelState> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(name) {
                return Arc::clone(channel);
            }
        }
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(name) {
            return Arc::clone(channel);
        }
        let channel = Arc::new(ChannelState {
            name: name.to_owned(),
            created_at: Instant::now(),
            subscribers: StdMutex::new(HashSet::new()),
            retained: StdMutex::new(VecDeque::new()),
            message_count: AtomicU64::new(0),
        });
        channels.insert(name.to_owned(), Arc::clone(&channel));
        channel
    }

    /// Subscribe a connection to a channel, returning any retained
    /// messages that should be replayed to it. Creates the channel first if
    /// `channels.auto_create` is enabled; otherwise a missing channel is
    /// [`ServerError::UnknownChannel`].
    pub async fn subscribe(
        &self,
        name: &str,
        conn_id: ConnId,
    ) -> Result<Vec<EventVector>, ServerError> {
        let channel = if self.config.channels.auto_create {
            self.get_or_create_channel(name).await
        } else {
            self.get_channel(name)
                .await
                .ok_or_else(|| ServerError::UnknownChannel(name.to_owned()))?
        };
        {
            let mut subs = channel.subscribers.lock().unwrap();
            if subs.len() >= self.config.channels.max_subscribers_per_channel
                && !subs.contains(&conn_id)
            {
                return Err(ServerError::ChannelFull(name.to_owned()));
            }
            subs.insert(conn_id);
        }
        if let Some(conn) = self.connection(conn_id).await {
            conn.subscriptions.lock().unwrap().insert(name.to_owned());
        }
        Ok(channel.retained.lock().unwrap().iter().cloned().collect())
    }

    /// Unsubscribe a connection from a channel. Returns `Ok(())` if the
    /// channel existed and the connection was removed from its subscriber
    /// set, `Err(UnknownChannel)` otherwise.
    pub async fn unsubscribe(&self, name: &str, conn_id: ConnId) -> Result<(), ServerError> {
        let Some(channel) = self.get_channel(name).await else {
            return Err(ServerError::UnknownChannel(name.to_owned()));
        };
        channel.subscribers.lock().unwrap().remove(&conn_id);
        if let Some(conn) = self.connection(conn_id).await {
            conn.subscriptions.lock().unwrap().remove(name);
        }
        Ok(())
    }

    /// Publish an event to every subscriber of `name`, optionally excluding
    /// `exclude` (the publishing connection, when `exclude-sender?` is set),
    /// recording it in the channel's retention ring if retention is
    /// configured. A missing channel with auto-create disabled is a no-op.
    pub async fn publish(
        &self,
        name: &str,
        event: EventVector,
        exclude: Option<ConnId>,
    ) -> usize {
        let channel = if self.config.channels.auto_create {
            Some(self.get_or_create_channel(name).await)
        } else {
            self.get_channel(name).await
        };
        let Some(channel) = channel else {
            return 0;
        };

        channel.message_count.fetch_add(1, Ordering::Relaxed);
        if self.config.channels.retention_len > 0 {
            let mut retained = channel.retained.lock().unwrap();
            retained.push_back(event.clone());
            while retained.len() > self.config.channels.retention_len {
                retained.pop_front();
            }
        }

        let subscriber_ids: Vec<ConnId> =
            channel.subscribers.lock().unwrap().iter().copied().collect();
        let mut delivered = 0;
        for conn_id in subscriber_ids {
            if exclude == Some(conn_id) {
                continue;
            }
            if let Some(conn) = self.connection(conn_id).await {
                let envelope = Envelope::fire_and_forget(event.clone());
                if conn.outbound.try_send(envelope).is_ok() {
                    delivered += 1;
                    self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        delivered
    }

    pub async fn channel_names(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    // -- handler table ----------------------------------------------------

    /// Register a handler for `event_id`. The handler receives the full
    /// [`Envelope`], including `callback_id` when the sender expects a
    /// correlated reply via [`ServerState::reply`].
    pub fn on_event(
        &self,
        event_id: impl Into<String>,
        handler: impl Fn(&ServerState, ConnId, &Envelope) + Send + Sync + 'static,
    ) {
        self.handlers
            .by_id
            .lock()
            .unwrap()
            .entry(event_id.into())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn on_any_event(
        &self,
        handler: impl Fn(&ServerState, ConnId, &Envelope) + Send + Sync + 'static,
    ) {
        self.handlers.catch_all.lock().unwrap().push(Arc::new(handler));
    }

    /// Runs every handler registered for `envelope.event.id`, then every
    /// catch-all handler. Returns `true` if at least one handler ran, so
    /// callers (the `other` branch of the connection routing table) know
    /// whether to fall back to the default `sente-lite/echo` reply.
    pub(crate) fn dispatch(&self, conn_id: ConnId, envelope: &Envelope) -> bool {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        let specific: Vec<EventHandler> = self
            .handlers
            .by_id
            .lock()
            .unwrap()
            .get(&envelope.event.id)
            .cloned()
            .unwrap_or_default();
        let catch_all: Vec<EventHandler> = self.handlers.catch_all.lock().unwrap().clone();

        let handled = !specific.is_empty() || !catch_all.is_empty();
        for handler in specific.iter().chain(catch_all.iter()) {
            let handler = Arc::clone(handler);
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| handler(self, conn_id, envelope)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                error!(event_id = %envelope.event.id, %message, "server handler panicked");
            }
        }
        handled
    }

    /// Reply to a specific connection with a callback-correlated event,
    /// the server-side half of Sente's `send-fn! [event cb]` pattern. Pass
    /// the `callback_id` from the [`Envelope`] a handler was invoked with.
    pub async fn reply(
        &self,
        conn_id: ConnId,
        callback_id: impl Into<String>,
        event: EventVector,
    ) -> Result<(), ServerError> {
        let conn = self
            .connection(conn_id)
            .await
            .ok_or(ServerError::UnknownConnection(conn_id))?;
        conn.outbound
            .try_send(Envelope::with_callback(event, callback_id))
            .map_err(|_| ServerError::QueueFull)
    }

    // -- stats --------------------------------------------------------------

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            connections_open: self.connections.read().await.len() as u64,
            connections_opened: self.stats.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.stats.connections_closed.load(Ordering::Relaxed),
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            channel_count: self.channels.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sente_lite_wire::EventVector;

    fn make_connection() -> (Arc<Connection>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(Connection {
            id: Uuid::new_v4(),
            opened_at: Instant::now(),
            last_seen: StdMutex::new(Instant::now()),
            last_pong: StdMutex::new(Instant::now()),
            outbound: tx,
            subscriptions: StdMutex::new(HashSet::new()),
            closer: Notify::new(),
        });
        (conn, rx)
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers_to_subscriber() {
        let state = ServerState::new(ServerConfig::default());
        let (conn, mut rx) = make_connection();
        state.register_connection(Arc::clone(&conn)).await;
        state.subscribe("room/1", conn.id).await.unwrap();

        let delivered = state
            .publish("room/1", EventVector::new("chat/msg"), None)
            .await;
        assert_eq!(delivered, 1);
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.id, "chat/msg");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let state = ServerState::new(ServerConfig::default());
        let (conn, mut rx) = make_connection();
        state.register_connection(Arc::clone(&conn)).await;
        state.subscribe("room/1", conn.id).await.unwrap();
        state.unsubscribe("room/1", conn.id).await.unwrap();

        state
            .publish("room/1", EventVector::new("chat/msg"), None)
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_can_exclude_the_sending_connection() {
        let state = ServerState::new(ServerConfig::default());
        let (sender, mut sender_rx) = make_connection();
        let (other, mut other_rx) = make_connection();
        state.register_connection(Arc::clone(&sender)).await;
        state.register_connection(Arc::clone(&other)).await;
        state.subscribe("room/1", sender.id).await.unwrap();
        state.subscribe("room/1", other.id).await.unwrap();

        let delivered = state
            .publish("room/1", EventVector::new("chat/msg"), Some(sender.id))
            .await;
        assert_eq!(delivered, 1);
        assert!(sender_rx.try_recv().is_err());
        assert!(other_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn publish_to_a_missing_channel_is_a_no_op_without_auto_create() {
        let mut config = ServerConfig::default();
        config.channels.auto_create = false;
        let state = ServerState::new(config);

        let delivered = state
            .publish("room/nonexistent", EventVector::new("chat/msg"), None)
            .await;
        assert_eq!(delivered, 0);
        assert!(state.get_channel("room/nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn retention_replays_to_new_subscribers() {
        let mut config = ServerConfig::default();
        config.channels.retention_len = 2;
        let state = ServerState::new(config);

        state
            .publish("room/1", EventVector::new("chat/one"), None)
            .await;
        state
            .publish("room/1", EventVector::new("chat/two"), None)
            .await;
        state
            .publish("room/1", EventVector::new("chat/three"), None)
            .await;

        let (conn, _rx) = make_connection();
        state.register_connection(Arc::clone(&conn)).await;
        let replay = state.subscribe("room/1", conn.id).await.unwrap();
        assert_eq!(replay.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["chat/two", "chat/three"]);
    }

    #[tokio::test]
    async fn channel_full_rejects_new_subscribers() {
        let mut config = ServerConfig::default();
        config.channels.max_subscribers_per_channel = 1;
        let state = ServerState::new(config);

        let (conn_a, _rx_a) = make_connection();
        let (conn_b, _rx_b) = make_connection();
        state.register_connection(Arc::clone(&conn_a)).await;
        state.register_connection(Arc::clone(&conn_b)).await;

        state.subscribe("room/1", conn_a.id).await.unwrap();
        let err = state.subscribe("room/1", conn_b.id).await.unwrap_err();
        assert!(matches!(err, ServerError::ChannelFull(_)));
    }

    #[tokio::test]
    async fn unregistering_a_connection_removes_it_from_subscribed_channels() {
        let state = ServerState::new(ServerConfig::default());
        let (conn, _rx) = make_connection();
        state.register_connection(Arc::clone(&conn)).await;
        state.subscribe("room/1", conn.id).await.unwrap();

        state.unregister_connection(conn.id).await;
        let delivered = state
            .publish("room/1", EventVector::new("chat/msg"), None)
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn dispatch_survives_a_panicking_handler() {
        let state = ServerState::new(ServerConfig::default());
        state.on_event("app/boom", |_, _, _| panic!("server handler exploded"));
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        state.on_event("app/boom", move |_, _, _| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        state.dispatch(
            Uuid::new_v4(),
            &Envelope::fire_and_forget(EventVector::new("app/boom")),
        );
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reply_sends_a_callback_correlated_envelope_to_the_connection() {
        let state = ServerState::new(ServerConfig::default());
        let (conn, mut rx) = make_connection();
        state.register_connection(Arc::clone(&conn)).await;

        state
            .reply(conn.id, "cb-42", EventVector::new("app/pong"))
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.callback_id.as_deref(), Some("cb-42"));
        assert_eq!(envelope.event.id, "app/pong");
    }
}
