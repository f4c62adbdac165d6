//! Outbound send queue: a bounded FIFO between application code and the
//! connection's write half, flushed on a timer rather than pulled message
//! by message. `try_enqueue` is the non-blocking path (`Ok` or
//! `QueueFull`); `enqueue_async` registers a FIFO waiter with its own
//! cancellable timeout when the queue is full, and `enqueue` (the blocking
//! path used by [`crate::Client::send`]) is just `enqueue_async` wrapped in
//! a oneshot so the caller can `.await` it.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sente_lite_wire::Envelope;

use crate::error::ClientError;

/// Configuration for a [`SendQueue`].
#[derive(Debug, Clone)]
pub struct SendQueueConfig {
    /// Maximum number of outbound messages buffered before `try_enqueue`
    /// starts dropping and `enqueue`/`enqueue_async` start waiting.
    pub capacity: usize,
    /// Default timeout for the blocking `enqueue` path. `None` waits
    /// indefinitely.
    pub default_timeout: Option<Duration>,
    /// How often the background flusher runs once [`SendQueue::start`] is
    /// called. The first flush happens immediately, not after one interval.
    pub flush_interval: Duration,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            default_timeout: Some(Duration::from_secs(5)),
            flush_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default)]
struct QueueStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    errors: AtomicU64,
    depth: AtomicU64,
}

/// A point-in-time snapshot of a [`SendQueue`]'s counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatsSnapshot {
    pub depth: usize,
    pub enqueued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub errors: u64,
}

/// The future a flush target returns for a single send attempt.
pub type SendFuture = Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send>>;
/// Called once per queued message during a flush; writes it to the wire.
pub type OnSend = Arc<dyn Fn(Envelope) -> SendFuture + Send + Sync>;
/// Called when `on_send` fails for a message. Never affects accounting —
/// `errors` is already incremented before this runs.
pub type OnError = Arc<dyn Fn(&ClientError, &Envelope) + Send + Sync>;

type AsyncCallback = Box<dyn FnOnce(Result<(), ClientError>) + Send>;

struct FlushTarget {
    on_send: OnSend,
    on_error: Option<OnError>,
}

struct Fifo {
    queue: VecDeque<Envelope>,
    capacity: usize,
}

/// A caller of `enqueue_async` (or `enqueue`, which is built on it) who
/// couldn't be enqueued immediately. Served in FIFO order as room frees up.
struct Waiter {
    id: u64,
    envelope: Envelope,
    callback: Mutex<Option<AsyncCallback>>,
    timeout_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct QueueState {
    fifo: Mutex<Fifo>,
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
    stats: QueueStats,
    next_waiter_id: AtomicU64,
    target: Mutex<Option<FlushTarget>>,
}

/// The send queue. Cheap to clone; every clone shares the same underlying
/// FIFO, waiter list, and counters.
#[derive(Clone)]
pub struct SendQueue {
    state: Arc<QueueState>,
    default_timeout: Option<Duration>,
    flush_interval: Duration,
    flush_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SendQueue {
    pub fn new(config: &SendQueueConfig) -> Self {
        let state = Arc::new(QueueState {
            fifo: Mutex::new(Fifo {
                queue: VecDeque::new(),
                capacity: config.capacity.max(1),
            }),
            waiters: Mutex::new(VecDeque::new()),
            stats: QueueStats::default(),
            next_waiter_id: AtomicU64::new(1),
            target: Mutex::new(None),
        });
        Self {
            state,
            default_timeout: config.default_timeout,
            flush_interval: config.flush_interval,
            flush_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Non-blocking enqueue: `Ok` if there was room, `QueueFull` (and
    /// `dropped` incremented) otherwise. Never registers a waiter.
    pub fn try_enqueue(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.try_push(envelope).map_err(|_dropped| {
            self.state.stats.dropped.fetch_add(1, Ordering::Relaxed);
            ClientError::QueueFull
        })
    }

    /// Tries an immediate enqueue; on success, invokes `callback(Ok(()))`
    /// synchronously. Otherwise registers a FIFO waiter with `timeout`
    /// (`None` waits indefinitely); when a later flush frees up room, the
    /// waiter's timeout is cancelled and `callback(Ok(()))` runs. If the
    /// timeout elapses first, `callback(Err(ClientError::Timeout))` runs.
    pub fn enqueue_async(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
        callback: impl FnOnce(Result<(), ClientError>) + Send + 'static,
    ) {
        match self.try_push(envelope) {
            Ok(()) => callback(Ok(())),
            Err(envelope) => self.register_waiter(envelope, timeout, Box::new(callback)),
        }
    }

    /// The blocking enqueue path used by [`crate::Client::send`]: waits up
    /// to `timeout` (or the configured default) for room, built on
    /// [`SendQueue::enqueue_async`].
    pub async fn enqueue(&self, envelope: Envelope, timeout: Option<Duration>) -> Result<(), ClientError> {
        let wait = timeout.or(self.default_timeout);
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.enqueue_async(envelope, wait, move |result| {
            let _ = tx.send(result);
        });
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Disconnected),
        }
    }

    /// Begin background flushing: the first flush runs immediately, then
    /// every `flush_interval` after that, until [`SendQueue::stop`] is
    /// called. Calling `start` again (e.g. after a reconnect) replaces the
    /// flush target and restarts the timer.
    pub fn start(&self, on_send: OnSend, on_error: Option<OnError>) {
        *self.state.target.lock().unwrap() = Some(FlushTarget { on_send, on_error });

        let state = Arc::clone(&self.state);
        let interval = self.flush_interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                flush_once(&state).await;
            }
        });

        if let Some(previous) = self.flush_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    /// Halt background flushing, drain everything left in the queue through
    /// the last flush target, cancel every pending waiter with
    /// [`ClientError::Timeout`], and return the final counters.
    pub async fn stop(&self) -> QueueStatsSnapshot {
        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }
        flush_once(&self.state).await;

        let waiters: Vec<Arc<Waiter>> = self.state.waiters.lock().unwrap().drain(..).collect();
        for waiter in waiters {
            if let Some(task) = waiter.timeout_task.lock().unwrap().take() {
                task.abort();
            }
            fire_waiter(&waiter, Err(ClientError::Timeout));
        }

        *self.state.target.lock().unwrap() = None;
        self.stats()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            depth: self.state.stats.depth.load(Ordering::Relaxed) as usize,
            enqueued: self.state.stats.enqueued.load(Ordering::Relaxed),
            sent: self.state.stats.sent.load(Ordering::Relaxed),
            dropped: self.state.stats.dropped.load(Ordering::Relaxed),
            errors: self.state.stats.errors.load(Ordering::Relaxed),
        }
    }

    fn try_push(&self, envelope: Envelope) -> Result<(), Envelope> {
        let mut fifo = self.state.fifo.lock().unwrap();
        if fifo.queue.len() >= fifo.capacity {
            return Err(envelope);
        }
        fifo.queue.push_back(envelope);
        drop(fifo);
        self.state.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.state.stats.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn register_waiter(&self, envelope: Envelope, timeout: Option<Duration>, callback: AsyncCallback) {
        let id = self.state.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let waiter = Arc::new(Waiter {
            id,
            envelope,
            callback: Mutex::new(Some(callback)),
            timeout_task: Mutex::new(None),
        });
        self.state.waiters.lock().unwrap().push_back(Arc::clone(&waiter));

        if let Some(duration) = timeout {
            let state = Arc::clone(&self.state);
            let waiter_for_task = Arc::clone(&waiter);
            let task = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if remove_waiter(&state.waiters, waiter_for_task.id) {
                    fire_waiter(&waiter_for_task, Err(ClientError::Timeout));
                }
            });
            *waiter.timeout_task.lock().unwrap() = Some(task);
        }
    }
}

/// Flush algorithm: atomically take the queue contents, call `on_send` for
/// each (fail-fast — a failed message is never requeued), then serve any
/// waiters whose enqueue can now succeed. A no-op if `start` hasn't been
/// called yet (no flush target registered).
async fn flush_once(state: &Arc<QueueState>) {
    let target = {
        let target = state.target.lock().unwrap();
        target
            .as_ref()
            .map(|t| (Arc::clone(&t.on_send), t.on_error.clone()))
    };
    let Some((on_send, on_error)) = target else {
        return;
    };

    let batch: Vec<Envelope> = {
        let mut fifo = state.fifo.lock().unwrap();
        fifo.queue.drain(..).collect()
    };
    if !batch.is_empty() {
        state.stats.depth.fetch_sub(batch.len() as u64, Ordering::Relaxed);
    }

    for envelope in batch {
        match on_send(envelope.clone()).await {
            Ok(()) => {
                state.stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                state.stats.errors.fetch_add(1, Ordering::Relaxed);
                if let Some(on_error) = &on_error {
                    on_error(&e, &envelope);
                }
            }
        }
    }

    serve_waiters(state);
}

fn serve_waiters(state: &Arc<QueueState>) {
    loop {
        let room = {
            let fifo = state.fifo.lock().unwrap();
            fifo.queue.len() < fifo.capacity
        };
        if !room {
            break;
        }
        let Some(waiter) = state.waiters.lock().unwrap().pop_front() else {
            break;
        };

        state.fifo.lock().unwrap().queue.push_back(waiter.envelope.clone());
        state.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        state.stats.depth.fetch_add(1, Ordering::Relaxed);

        if let Some(task) = waiter.timeout_task.lock().unwrap().take() {
            task.abort();
        }
        fire_waiter(&waiter, Ok(()));
    }
}

fn remove_waiter(waiters: &Mutex<VecDeque<Arc<Waiter>>>, id: u64) -> bool {
    let mut waiters = waiters.lock().unwrap();
    if let Some(pos) = waiters.iter().position(|w| w.id == id) {
        waiters.remove(pos);
        true
    } else {
        false
    }
}

fn fire_waiter(waiter: &Waiter, result: Result<(), ClientError>) {
    if let Some(callback) = waiter.callback.lock().unwrap().take() {
        callback(result);
    }
}
