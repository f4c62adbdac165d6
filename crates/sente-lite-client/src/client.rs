//! The client connection: handshake, reconnect/backoff state machine,
//! transport-level heartbeat reply, and the public send/handler API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sente_lite_wire::{chsk, decode, encode, is_reserved, sente_lite, EdnValue, Envelope, EventVector, Ident};
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReconnectConfig};
use crate::error::ClientError;
use crate::queue::{self, OnError, OnSend, SendQueue};
use crate::registry::{HandlerId, HandlerRegistry};
use crate::table::{self, ClientHandle};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WriteHalf = futures_util::stream::SplitSink<WsStream, Message>;

fn kw(name: &str) -> EdnValue {
    EdnValue::Keyword(Ident::new(name))
}

fn subscribe_event(event_id: &str, channel_id: String) -> EventVector {
    EventVector::with_data(
        event_id,
        EdnValue::Map(vec![(kw("channel-id"), EdnValue::Str(channel_id))]),
    )
}

/// `chsk/state` data: `open?` tracks the current socket state, `first-open?`
/// is only true the very first time the client reaches `Connected` — lets
/// application `chsk/state` handlers tell "on-open" apart from "on-reconnect".
fn state_event(open: bool, first_open: bool) -> EventVector {
    EventVector::with_data(
        chsk::STATE,
        EdnValue::Map(vec![
            (kw("open?"), EdnValue::Bool(open)),
            (kw("first-open?"), EdnValue::Bool(first_open)),
        ]),
    )
}

/// Delivered to every pending once-handler the instant the socket drops, so
/// an RPC waiter doesn't sit until its own timeout to learn the connection
/// is gone.
fn disconnect_event() -> EventVector {
    EventVector::with_data(
        "local/closed",
        EdnValue::Map(vec![
            (kw("error"), kw("closed")),
            (kw("reason"), kw("disconnected")),
        ]),
    )
}

/// Connection lifecycle state, mirrored to application code via the
/// `chsk/state` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Shared state behind a [`Client`] handle. Background tasks reach this
/// through the process-wide table (see [`crate::table`]) rather than
/// holding a strong reference directly.
pub struct ClientInner {
    config: ClientConfig,
    registry: Arc<HandlerRegistry>,
    send_queue: SendQueue,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    /// The live reconnect policy, seeded from `config.reconnect` but
    /// replaceable at runtime via [`Client::set_reconnect`].
    reconnect: Mutex<ReconnectConfig>,
    /// Count of reconnect attempts since the client was created. Per design,
    /// this does *not* reset on a successful handshake — it is a lifetime
    /// counter, not a current-backoff-run counter.
    reconnect_count: AtomicU64,
    /// Set once the client reaches `Connected` for the first time; used to
    /// tell the initial open apart from a later reconnect in `chsk/state`.
    ever_connected: std::sync::atomic::AtomicBool,
    /// Waiters for `request()` replies, keyed by the cb-uuid sent with the
    /// original event.
    pending_replies: Mutex<HashMap<String, oneshot::Sender<EventVector>>>,
    /// The id assigned by the server on the most recent handshake.
    uid: Mutex<Option<String>>,
}

impl ClientInner {
    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (shutdown_tx, _) = watch::channel(false);
        let send_queue = SendQueue::new(&crate::queue::SendQueueConfig::default());
        Self {
            config: ClientConfig {
                server_url: "ws://unused".to_owned(),
                token: None,
                reconnect: crate::config::ReconnectConfig::default(),
                heartbeat: crate::config::HeartbeatConfig::default(),
                send_queue: crate::queue::SendQueueConfig::default(),
                wrap_recv: false,
            },
            registry: Arc::new(HandlerRegistry::new()),
            send_queue,
            state_tx,
            shutdown_tx,
            reconnect: Mutex::new(crate::config::ReconnectConfig::default()),
            reconnect_count: AtomicU64::new(0),
            ever_connected: std::sync::atomic::AtomicBool::new(false),
            pending_replies: Mutex::new(HashMap::new()),
            uid: Mutex::new(None),
        }
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn uid(&self) -> Option<String> {
        self.uid.lock().unwrap().clone()
    }
}

/// A connected (or reconnecting) sente-lite client.
///
/// Cloning a [`Client`] shares the same underlying connection, send queue,
/// and handler registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    handle: ClientHandle,
}

impl Client {
    /// Connect to `config.server_url`, spawning the background task that
    /// owns the socket and runs the reconnect state machine. Returns once
    /// the handler registry and send queue are ready to use — the first
    /// connection attempt happens in the background, observable via
    /// [`Client::state`] or a `chsk/state` handler.
    pub fn connect(config: ClientConfig) -> Client {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let send_queue = SendQueue::new(&config.send_queue);
        let reconnect = Mutex::new(config.reconnect.clone());

        let inner = Arc::new(ClientInner {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            send_queue,
            state_tx,
            shutdown_tx,
            reconnect,
            reconnect_count: AtomicU64::new(0),
            ever_connected: std::sync::atomic::AtomicBool::new(false),
            pending_replies: Mutex::new(HashMap::new()),
            uid: Mutex::new(None),
        });
        let handle = table::register(&inner);

        tokio::spawn(run_connection_loop(handle, shutdown_rx));

        Client { inner, handle }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnect_count()
    }

    /// The id assigned by the server on the most recent handshake, if a
    /// handshake has completed yet.
    pub fn get_uid(&self) -> Option<String> {
        self.inner.uid()
    }

    /// Number of handlers currently registered.
    pub fn handler_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// A snapshot of the outbound send queue's counters.
    pub fn queue_stats(&self) -> queue::QueueStatsSnapshot {
        self.inner.send_queue.stats()
    }

    /// Replace the reconnect policy in effect for every future backoff
    /// computation. Does not affect a backoff sleep already in progress.
    pub fn set_reconnect(&self, reconnect: crate::config::ReconnectConfig) {
        *self.inner.reconnect.lock().unwrap() = reconnect;
    }

    /// Subscribe to a server-side channel.
    pub async fn subscribe(&self, channel_id: impl Into<String>) -> Result<(), ClientError> {
        self.send(subscribe_event(sente_lite::SUBSCRIBE, channel_id.into()), None)
            .await
    }

    /// Unsubscribe from a server-side channel.
    pub async fn unsubscribe(&self, channel_id: impl Into<String>) -> Result<(), ClientError> {
        self.send(subscribe_event(sente_lite::UNSUBSCRIBE, channel_id.into()), None)
            .await
    }

    /// Publish `data` to a server-side channel. When `exclude_sender` is
    /// true the server will not echo the message back to this connection.
    pub async fn publish(
        &self,
        channel_id: impl Into<String>,
        data: EdnValue,
        exclude_sender: bool,
    ) -> Result<(), ClientError> {
        let payload = EdnValue::Map(vec![
            (kw("channel-id"), EdnValue::Str(channel_id.into())),
            (kw("data"), data),
            (kw("exclude-sender?"), EdnValue::Bool(exclude_sender)),
        ]);
        self.send(EventVector::with_data(sente_lite::PUBLISH, payload), None)
            .await
    }

    /// Register a persistent handler for `event_id`.
    pub fn on(
        &self,
        event_id: impl Into<String>,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.registry.on(event_id, handler)
    }

    /// Register a persistent handler matching a custom predicate instead of
    /// a fixed event id.
    pub fn on_predicate(
        &self,
        predicate: impl Fn(&EventVector) -> bool + Send + Sync + 'static,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.registry.on_predicate(predicate, handler)
    }

    /// Register a handler that fires for every event not claimed by a more
    /// specific registration that ran before it.
    pub fn on_any(&self, handler: impl Fn(&EventVector) + Send + Sync + 'static) -> HandlerId {
        self.inner.registry.on_any(handler)
    }

    /// `take`: register a handler that fires at most once for `event_id`,
    /// then unregisters itself. If `timeout` elapses first the handler
    /// fires with a synthetic `{error: :timeout}` event instead.
    pub fn take(
        &self,
        event_id: impl Into<String>,
        timeout: Option<Duration>,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.registry.once(event_id, timeout, handler)
    }

    /// Like [`Client::take`], but matching a custom predicate instead of a
    /// fixed event id.
    pub fn take_predicate(
        &self,
        predicate: impl Fn(&EventVector) -> bool + Send + Sync + 'static,
        timeout: Option<Duration>,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
    ) -> HandlerId {
        self.inner.registry.once_predicate(predicate, timeout, handler)
    }

    /// Register a one-shot waiter matching `data.request-id == request_id`,
    /// resolving with the first matching event or timing out.
    pub fn rpc_waiter(
        &self,
        request_id: impl Into<String>,
        timeout: Duration,
    ) -> (HandlerId, oneshot::Receiver<EventVector>) {
        self.inner.registry.rpc_waiter(request_id, timeout)
    }

    /// Unregister a previously-registered handler.
    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.registry.off(id)
    }

    /// Send an event with no reply expected, respecting queue backpressure
    /// (waits up to `timeout`, or the configured default).
    pub async fn send(
        &self,
        event: EventVector,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        self.inner
            .send_queue
            .enqueue(Envelope::fire_and_forget(event), timeout)
            .await
    }

    /// Send without waiting for queue room; drops the message immediately
    /// if the queue is full.
    pub fn send_now(&self, event: EventVector) -> Result<(), ClientError> {
        self.inner
            .send_queue
            .try_enqueue(Envelope::fire_and_forget(event))
    }

    /// Send an event and wait for a correlated reply, Sente's
    /// `send-fn! [event cb]` pattern.
    pub async fn request(
        &self,
        event: EventVector,
        timeout: Duration,
    ) -> Result<EventVector, ClientError> {
        let callback_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_replies
            .lock()
            .unwrap()
            .insert(callback_id.clone(), tx);

        if let Err(e) = self
            .inner
            .send_queue
            .enqueue(Envelope::with_callback(event, callback_id.clone()), Some(timeout))
            .await
        {
            self.inner.pending_replies.lock().unwrap().remove(&callback_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) | Err(_) => {
                self.inner.pending_replies.lock().unwrap().remove(&callback_id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Initiate a graceful shutdown: stops reconnect attempts and closes
    /// the socket.
    pub fn close(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        table::unregister(self.handle);
    }
}

async fn run_connection_loop(handle: ClientHandle, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let Some(inner) = table::lookup(handle) else {
            return;
        };

        let attempt = inner.reconnect_count.fetch_add(1, Ordering::Relaxed);
        let _ = inner.state_tx.send(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        match connect_once(&inner).await {
            Ok(ws) => {
                let first_open = !inner.ever_connected.swap(true, Ordering::Relaxed);
                let _ = inner.state_tx.send(ConnectionState::Connected);
                inner.registry.dispatch(&state_event(true, first_open));
                info!(attempt, first_open, "connected");

                run_socket(&inner, ws, &mut shutdown).await;
                inner.send_queue.stop().await;

                if *shutdown.borrow() {
                    let _ = inner.state_tx.send(ConnectionState::Closed);
                    return;
                }
                let _ = inner.state_tx.send(ConnectionState::Reconnecting);
                inner.registry.fail_all_once(&disconnect_event());
                inner.registry.dispatch(&state_event(false, false));
            }
            Err(e) => {
                warn!(attempt, error = %e, "connect attempt failed");
            }
        }

        let backoff = backoff_for_attempt(&inner, attempt);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = inner.state_tx.send(ConnectionState::Closed);
                    return;
                }
            }
        }
    }
}

fn backoff_for_attempt(inner: &ClientInner, attempt: u64) -> Duration {
    let cfg = inner.reconnect.lock().unwrap();
    let scaled = cfg.initial_backoff.as_secs_f64() * cfg.multiplier.powi(attempt.min(32) as i32);
    Duration::from_secs_f64(scaled.min(cfg.max_backoff.as_secs_f64()))
}

async fn connect_once(inner: &ClientInner) -> Result<WsStream, ClientError> {
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = inner
        .config
        .server_url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::Connect(format!("invalid URL: {e}")))?;
    if let Some(token) = &inner.config.token {
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {token}")
                .parse()
                .map_err(|e| ClientError::Connect(format!("invalid auth header: {e}")))?,
        );
    }

    let (ws, _response) = connect_async(request)
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;
    Ok(ws)
}

/// Wraps the socket's write half behind a shared lock so both the send
/// queue's flush task and this loop's own ping/pong writes can use it.
fn make_on_send(sink: Arc<tokio::sync::Mutex<WriteHalf>>) -> OnSend {
    Arc::new(move |envelope| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            let text = encode(&envelope);
            sink.lock()
                .await
                .send(Message::Text(text.into()))
                .await
                .map_err(ClientError::from)
        })
    })
}

fn make_on_error() -> OnError {
    Arc::new(|err: &ClientError, envelope| {
        warn!(error = %err, event_id = %envelope.event.id, "send queue flush failed");
    })
}

async fn run_socket(inner: &ClientInner, ws: WsStream, shutdown: &mut watch::Receiver<bool>) {
    let (write, mut read) = ws.split();
    let sink = Arc::new(tokio::sync::Mutex::new(write));
    inner.send_queue.start(make_on_send(Arc::clone(&sink)), Some(make_on_error()));

    let ping_interval = inner.config.heartbeat.ping_interval;
    let mut ping_timer = tokio::time::interval(ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = sink.lock().await.send(Message::Close(None)).await;
                    return;
                }
            }
            msg = read.next() => {
                match msg {
                    None => return,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        return;
                    }
                    Some(Ok(Message::Text(text))) => handle_inbound_text(inner, &text),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.lock().await.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
            _ = ping_timer.tick() => {
                let ping = Envelope::fire_and_forget(EventVector::new(chsk::WS_PING));
                if let Err(e) = sink.lock().await.send(Message::Text(encode(&ping).into())).await {
                    warn!(error = %e, "failed to send ws-ping");
                    return;
                }
            }
        }
    }
}

fn handle_inbound_text(inner: &ClientInner, text: &str) {
    let envelope = match decode(text) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "routing malformed wire message as chsk/bad-event");
            let bad = EventVector::with_data(chsk::BAD_EVENT, EdnValue::Str(text.to_owned()));
            inner.registry.dispatch(&bad);
            return;
        }
    };

    let event = envelope.event;
    if event.id == chsk::WS_PING {
        let _ = inner
            .send_queue
            .try_enqueue(Envelope::fire_and_forget(EventVector::new(chsk::WS_PONG)));
        return;
    }
    if event.id == chsk::WS_PONG {
        return;
    }
    if event.id == chsk::HANDSHAKE {
        if let Some(uid) = event
            .data
            .as_ref()
            .and_then(EdnValue::as_vector)
            .and_then(|v| v.first())
            .and_then(EdnValue::as_str)
        {
            *inner.uid.lock().unwrap() = Some(uid.to_owned());
        }
    }

    if let Some(callback_id) = envelope.callback_id {
        let waiter = inner.pending_replies.lock().unwrap().remove(&callback_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => dispatch_with_recv_normalization(inner, event),
        }
        return;
    }
    dispatch_with_recv_normalization(inner, event);
}

/// Applies the `wrap-recv?` receive-normalization rule before handing an
/// event to the registry: unwraps inbound `chsk/recv` envelopes when
/// `wrap_recv` is off (the default), or wraps non-system events in one when
/// it's on.
fn dispatch_with_recv_normalization(inner: &ClientInner, event: EventVector) {
    if !inner.config.wrap_recv && event.id == chsk::RECV {
        if let Some(pair) = event.data.as_ref().and_then(EdnValue::as_vector) {
            if let [inner_id, inner_data] = pair.as_slice() {
                if let Some(inner_id) = inner_id.as_str() {
                    let unwrapped = EventVector::with_data(inner_id, inner_data.clone());
                    inner.registry.dispatch(&unwrapped);
                    return;
                }
            }
        }
    }
    if inner.config.wrap_recv && !is_reserved(&event.id) {
        let wrapped_data = EdnValue::Vector(vec![
            EdnValue::Str(event.id.clone()),
            event.data.clone().unwrap_or(EdnValue::Nil),
        ]);
        let wrapped = EventVector::with_data(chsk::RECV, wrapped_data);
        inner.registry.dispatch(&wrapped);
        return;
    }
    inner.registry.dispatch(&event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically_and_caps() {
        let inner = ClientInner::new_for_test();
        let first = backoff_for_attempt(&inner, 0);
        let second = backoff_for_attempt(&inner, 1);
        assert!(second > first);
        let capped = backoff_for_attempt(&inner, 40);
        assert_eq!(capped, inner.config.reconnect.max_backoff);
    }

    #[test]
    fn set_reconnect_changes_future_backoff() {
        let inner = ClientInner::new_for_test();
        let default_first = backoff_for_attempt(&inner, 0);

        *inner.reconnect.lock().unwrap() = crate::config::ReconnectConfig {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        };
        let updated_first = backoff_for_attempt(&inner, 0);

        assert_ne!(default_first, updated_first);
        assert_eq!(updated_first, Duration::from_millis(5));
    }
}
