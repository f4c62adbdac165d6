//! Handler registry: event-id / predicate / catch-all matching, once
//! semantics with an optional cancellable timeout, and an RPC-style
//! convenience that resolves a future when a matching event arrives.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sente_lite_wire::{EdnValue, EventVector};
use tokio::sync::oneshot;
use tracing::{error, warn};

/// Opaque id returned by [`HandlerRegistry::on`] and friends, used to
/// unregister a handler later via [`HandlerRegistry::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// What a registration matches against.
enum Matcher {
    EventId(String),
    Predicate(Box<dyn Fn(&EventVector) -> bool + Send + Sync>),
    CatchAll,
}

impl Matcher {
    fn matches(&self, event: &EventVector) -> bool {
        match self {
            Matcher::EventId(id) => event.id == *id,
            Matcher::Predicate(p) => p(event),
            Matcher::CatchAll => true,
        }
    }
}

type HandlerFn = Arc<dyn Fn(&EventVector) + Send + Sync>;

struct Registration {
    id: HandlerId,
    matcher: Matcher,
    handler: HandlerFn,
    once: bool,
    /// Cancels the timeout sweep if the handler fires (or is removed) first.
    timeout_task: Option<tokio::task::JoinHandle<()>>,
}

/// A process-wide (well, client-wide) table of event handlers, dispatched
/// in registration order on every inbound event.
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<Vec<Registration>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a persistent handler for a specific event id.
    pub fn on(
        &self,
        event_id: impl Into<String>,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
    ) -> HandlerId {
        self.register(Matcher::EventId(event_id.into()), handler, false)
    }

    /// Register a persistent handler matching a custom predicate.
    pub fn on_predicate(
        &self,
        predicate: impl Fn(&EventVector) -> bool + Send + Sync + 'static,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
    ) -> HandlerId {
        let matcher = Matcher::Predicate(Box::new(predicate));
        self.register(matcher, handler, false)
    }

    /// Register a handler that fires for every event not claimed by a more
    /// specific registration that ran before it.
    pub fn on_any(&self, handler: impl Fn(&EventVector) + Send + Sync + 'static) -> HandlerId {
        self.register(Matcher::CatchAll, handler, false)
    }

    fn register(
        &self,
        matcher: Matcher,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
        once: bool,
    ) -> HandlerId {
        let id = self.next_id();
        self.handlers.lock().unwrap().push(Registration {
            id,
            matcher,
            handler: Arc::new(handler),
            once,
            timeout_task: None,
        });
        id
    }

    /// Register a handler that fires at most once, then unregisters
    /// itself. If `timeout` elapses first, the handler is removed without
    /// firing.
    pub fn once(
        self: &Arc<Self>,
        event_id: impl Into<String>,
        timeout: Option<Duration>,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
    ) -> HandlerId {
        self.once_matching(Matcher::EventId(event_id.into()), timeout, handler)
    }

    /// Register a once-firing handler matching a custom predicate rather
    /// than a fixed event id. Used by [`HandlerRegistry::rpc_waiter`] and
    /// available directly for request/reply correlation on other fields.
    pub fn once_predicate(
        self: &Arc<Self>,
        predicate: impl Fn(&EventVector) -> bool + Send + Sync + 'static,
        timeout: Option<Duration>,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
    ) -> HandlerId {
        self.once_matching(Matcher::Predicate(Box::new(predicate)), timeout, handler)
    }

    fn once_matching(
        self: &Arc<Self>,
        matcher: Matcher,
        timeout: Option<Duration>,
        handler: impl Fn(&EventVector) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.register(matcher, handler, true);
        if let Some(duration) = timeout {
            let registry = Arc::clone(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let fired_handler = registry
                    .handlers
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|r| r.id == id)
                    .map(|r| Arc::clone(&r.handler));
                if let Some(handler) = fired_handler {
                    if registry.off(id) {
                        warn!(?id, "once-handler timed out; firing with a timeout event");
                        handler(&timeout_event());
                    }
                }
            });
            if let Some(reg) = self
                .handlers
                .lock()
                .unwrap()
                .iter_mut()
                .find(|r| r.id == id)
            {
                reg.timeout_task = Some(task);
            }
        }
        id
    }

    /// Remove a handler by id. Returns `true` if it was present.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(pos) = handlers.iter().position(|r| r.id == id) {
            let reg = handlers.remove(pos);
            if let Some(task) = reg.timeout_task {
                task.abort();
            }
            true
        } else {
            false
        }
    }

    /// Register a one-shot waiter matching `data.request-id == request_id`,
    /// returning its id and a receiver that resolves with the first
    /// matching event. A convenience built on
    /// [`HandlerRegistry::once_predicate`] for request/reply call patterns
    /// that correlate on an application-chosen request id rather than a
    /// fixed event id.
    pub fn rpc_waiter(
        self: &Arc<Self>,
        request_id: impl Into<String>,
        timeout: Duration,
    ) -> (HandlerId, oneshot::Receiver<EventVector>) {
        let request_id = request_id.into();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.once_predicate(
            move |event| request_id_matches(event, &request_id),
            Some(timeout),
            move |event| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(event.clone());
                }
            },
        );
        (id, rx)
    }

    /// Force-fire every currently-registered once-handler with `event`,
    /// ignoring its matcher, and unregister them. Used when the connection
    /// drops so a pending once/RPC waiter doesn't hang until its timeout —
    /// it learns about the disconnect immediately instead.
    pub fn fail_all_once(&self, event: &EventVector) {
        let once_handlers: Vec<(HandlerId, HandlerFn)> = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .iter()
                .filter(|r| r.once)
                .map(|r| (r.id, Arc::clone(&r.handler)))
                .collect()
        };
        for (id, handler) in once_handlers {
            if self.off(id) {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
                if let Err(panic) = result {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_owned());
                    error!(%message, "once-handler panicked while being force-fired on disconnect");
                }
            }
        }
    }

    /// Dispatch an inbound event to every matching handler, in registration
    /// order. Handler panics are caught, logged, and swallowed so one
    /// misbehaving callback cannot take down the read loop.
    pub fn dispatch(&self, event: &EventVector) {
        let (matched, once_ids): (Vec<HandlerFn>, Vec<HandlerId>) = {
            let handlers = self.handlers.lock().unwrap();
            let mut fns = Vec::new();
            let mut once_ids = Vec::new();
            for reg in handlers.iter() {
                if reg.matcher.matches(event) {
                    fns.push(Arc::clone(&reg.handler));
                    if reg.once {
                        once_ids.push(reg.id);
                    }
                }
            }
            (fns, once_ids)
        };

        for handler in &matched {
            let handler = Arc::clone(handler);
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                error!(event_id = %event.id, %message, "handler panicked");
            }
        }

        for id in once_ids {
            self.off(id);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Synthetic event delivered to a `once`/`rpc_waiter` handler when its
/// timeout elapses before a match arrives. Local only — never sent or
/// received over the wire, so it lives outside the `chsk`/`sente-lite`
/// namespaces.
fn timeout_event() -> EventVector {
    EventVector::with_data(
        "local/timeout",
        EdnValue::Map(vec![(
            EdnValue::Keyword(sente_lite_wire::Ident::new("error")),
            EdnValue::Keyword(sente_lite_wire::Ident::new("timeout")),
        )]),
    )
}

/// True if `event.data.request-id` is a string equal to `request_id`.
fn request_id_matches(event: &EventVector, request_id: &str) -> bool {
    event
        .data
        .as_ref()
        .and_then(|d| d.map_get("request-id"))
        .and_then(EdnValue::as_str)
        .is_some_and(|v| v == request_id)
}
