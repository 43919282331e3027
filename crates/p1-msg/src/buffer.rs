//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process fan-out buffers between pipeline stages."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use prometheus::Registry;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::metrics::{BufferCounters, BufferMetrics};
use crate::{MessagingError, Result};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Queue sizing for a [`MessageBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferOptions {
    /// `None` for unbounded queues. With `Some(n)` the ingress queue and every
    /// handler queue hold at most `n` items and the newest item is dropped when
    /// a queue is full.
    pub capacity: Option<usize>,
}

impl BufferOptions {
    /// Unbounded queues; `publish` never drops.
    pub fn unbounded() -> Self {
        Self { capacity: None }
    }

    /// Bounded queues with drop-newest overflow.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
        }
    }
}

/// Result of handing an item to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The item is queued for dispatch.
    Queued,
    /// The bounded ingress queue was full and the item was discarded.
    Dropped,
    /// The dispatch loop is gone; nothing will be delivered any more.
    Closed,
}

enum QueueTx<T> {
    Unbounded(mpsc::UnboundedSender<T>),
    Bounded(mpsc::Sender<T>),
}

impl<T> Clone for QueueTx<T> {
    fn clone(&self) -> Self {
        match self {
            QueueTx::Unbounded(tx) => QueueTx::Unbounded(tx.clone()),
            QueueTx::Bounded(tx) => QueueTx::Bounded(tx.clone()),
        }
    }
}

impl<T> QueueTx<T> {
    fn try_push(&self, name: &str, item: T) -> Result<()> {
        match self {
            QueueTx::Unbounded(tx) => tx
                .send(item)
                .map_err(|_| MessagingError::QueueClosed(name.to_owned())),
            QueueTx::Bounded(tx) => tx.try_send(item).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => MessagingError::QueueFull(name.to_owned()),
                mpsc::error::TrySendError::Closed(_) => {
                    MessagingError::QueueClosed(name.to_owned())
                }
            }),
        }
    }
}

enum QueueRx<T> {
    Unbounded(mpsc::UnboundedReceiver<T>),
    Bounded(mpsc::Receiver<T>),
}

impl<T> QueueRx<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            QueueRx::Unbounded(rx) => rx.recv().await,
            QueueRx::Bounded(rx) => rx.recv().await,
        }
    }
}

fn queue<T>(capacity: Option<usize>) -> (QueueTx<T>, QueueRx<T>) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (QueueTx::Bounded(tx), QueueRx::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueTx::Unbounded(tx), QueueRx::Unbounded(rx))
        }
    }
}

/// Registered handler as seen by the dispatch loop: a name and the queue
/// feeding its worker task.
struct HandlerSlot<T> {
    name: String,
    tx: QueueTx<T>,
}

struct Shared<T> {
    name: String,
    options: BufferOptions,
    handlers: RwLock<Vec<Arc<HandlerSlot<T>>>>,
    counters: BufferCounters,
}

/// Ordered single-producer/multi-consumer relay.
///
/// `publish` hands the item to an ingress queue and returns immediately. A
/// dispatch task drains that queue in publish order and passes a clone of each
/// item to every handler registered at that moment. Each handler owns a worker
/// task with its own ordered queue: handlers for one item run concurrently,
/// every handler sees items in publish order, and a slow handler only delays
/// its own backlog. Handler errors and panics are logged and swallowed by the
/// worker.
///
/// Cloning the buffer yields another handle to the same queues. The dispatch
/// loop and the handler workers stop once every handle has been dropped.
pub struct MessageBuffer<T> {
    shared: Arc<Shared<T>>,
    ingress: QueueTx<T>,
}

impl<T> Clone for MessageBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            ingress: self.ingress.clone(),
        }
    }
}

impl<T> std::fmt::Debug for MessageBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("name", &self.shared.name)
            .field("options", &self.shared.options)
            .field("handlers", &self.shared.handlers.read().len())
            .finish_non_exhaustive()
    }
}

impl<T> MessageBuffer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an unbounded buffer with a private metrics registry and spawn
    /// its dispatch loop.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_options(name, BufferOptions::default())
    }

    /// Create a buffer with explicit queue sizing and a private metrics
    /// registry.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn with_options(name: impl Into<String>, options: BufferOptions) -> Result<Self> {
        Self::with_registry(name, options, &Registry::new())
    }

    /// Create a buffer whose metrics are registered with `registry` under a
    /// `buffer` label carrying its name.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn with_registry(
        name: impl Into<String>,
        options: BufferOptions,
        registry: &Registry,
    ) -> Result<Self> {
        let name = name.into();
        let counters = BufferCounters::register(registry, &name)?;
        let (ingress, rx) = queue(options.capacity);
        let shared = Arc::new(Shared {
            name,
            options,
            handlers: RwLock::new(Vec::new()),
            counters,
        });
        tokio::spawn(dispatch_loop(Arc::clone(&shared), rx));
        debug!(buffer = %shared.name, capacity = ?options.capacity, "message buffer started");
        Ok(Self { shared, ingress })
    }

    /// Hand an item to the buffer without waiting for any consumer.
    pub fn publish(&self, item: T) -> PublishOutcome {
        self.shared.counters.record_handoff();
        match self.ingress.try_push(&self.shared.name, item) {
            Ok(()) => {
                self.shared.counters.record_published();
                PublishOutcome::Queued
            }
            Err(MessagingError::QueueFull(queue)) => {
                self.shared.counters.record_publish_rejected(true);
                warn!(buffer = %queue, "ingress queue full; dropping newest item");
                PublishOutcome::Dropped
            }
            Err(err) => {
                self.shared.counters.record_publish_rejected(false);
                error!(buffer = %self.shared.name, error = %err, "dispatch loop is gone; item discarded");
                PublishOutcome::Closed
            }
        }
    }

    /// Register a handler under a generated name.
    ///
    /// The handler receives every item dispatched after this call; items that
    /// were dispatched earlier are not replayed.
    pub fn register<F, Fut>(&self, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = format!("{}-handler-{}", self.shared.name, self.handler_count());
        self.register_named(name, handler);
    }

    /// Register a handler whose name appears in log events.
    pub fn register_named<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handler: Handler<T> = Arc::new(move |item| handler(item).boxed());
        let (tx, rx) = queue(self.shared.options.capacity);

        tokio::spawn(handler_worker(
            self.shared.name.clone(),
            name.clone(),
            handler,
            rx,
            self.shared.counters.clone(),
        ));

        self.shared
            .handlers
            .write()
            .push(Arc::new(HandlerSlot { name: name.clone(), tx }));
        debug!(buffer = %self.shared.name, handler = %name, "handler registered");
    }

    /// Number of handlers currently registered.
    pub fn handler_count(&self) -> usize {
        self.shared.handlers.read().len()
    }

    /// Buffer name used in log events.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current activity counters.
    pub fn metrics(&self) -> BufferMetrics {
        self.shared.counters.snapshot()
    }

    /// Wait until every published item has been handled by every handler it
    /// was handed to. Returns `false` if work is still pending after `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.counters.pending() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }
}

async fn dispatch_loop<T>(shared: Arc<Shared<T>>, mut ingress: QueueRx<T>)
where
    T: Clone + Send + Sync + 'static,
{
    while let Some(item) = ingress.recv().await {
        // Registration only contends with this snapshot, never with handler execution.
        let handlers: Vec<Arc<HandlerSlot<T>>> = shared.handlers.read().clone();
        if handlers.is_empty() {
            debug!(buffer = %shared.name, "no handlers registered; item discarded");
        }
        for slot in &handlers {
            shared.counters.record_handoff();
            match slot.tx.try_push(&slot.name, item.clone()) {
                Ok(()) => {}
                Err(MessagingError::QueueFull(handler)) => {
                    shared.counters.record_handoff_rejected(true);
                    warn!(buffer = %shared.name, handler = %handler, "handler queue full; dropping newest item");
                }
                Err(err) => {
                    shared.counters.record_handoff_rejected(false);
                    error!(buffer = %shared.name, handler = %slot.name, error = %err, "handler worker is gone");
                }
            }
        }
        shared.counters.record_dispatched();
    }
    debug!(buffer = %shared.name, "dispatch loop finished");
}

async fn handler_worker<T>(
    buffer: String,
    name: String,
    handler: Handler<T>,
    mut rx: QueueRx<T>,
    counters: BufferCounters,
) where
    T: Send + 'static,
{
    while let Some(item) = rx.recv().await {
        let invocation = AssertUnwindSafe(async { handler(item).await }).catch_unwind();
        match invocation.await {
            Ok(Ok(())) => counters.record_delivered(),
            Ok(Err(err)) => {
                counters.record_failed();
                error!(buffer = %buffer, handler = %name, error = %format!("{err:#}"), "message handler failed");
            }
            Err(panic) => {
                counters.record_failed();
                error!(buffer = %buffer, handler = %name, panic = %panic_message(panic.as_ref()), "message handler panicked");
            }
        }
    }
    debug!(buffer = %buffer, handler = %name, "handler worker finished");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
