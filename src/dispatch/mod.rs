//! Single-consumer event dispatcher.
//!
//! Producers hold an [`EventSink`] and never block: the queue is an unbounded
//! tokio channel. One worker task pops events in arrival order and hands each
//! one to every listener in a registry snapshot taken for that event.
//!
//! ```text
//!   watcher (stdout) ──┐
//!   watcher (stderr) ──┤
//!   monitor          ──┼──► [unbounded FIFO] ──► worker ──► L1, L2, … Ln
//!   waiter           ──┤                      (snapshot per event)
//!   control surface  ──┘
//! ```
//!
//! Because there is exactly one consumer, every listener observes the same
//! global order.

pub mod listeners;
pub mod registry;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::events::Event;

pub use registry::{Listener, ListenerId, ListenerRegistry};

/// Producer handle for the dispatcher queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Enqueue an event. Never blocks; events published after the dispatcher
    /// shut down are dropped.
    pub fn publish(&self, event: Event) {
        if let Err(err) = self.tx.send(event) {
            debug!(
                event = err.0.name(),
                "dispatcher closed, dropping event"
            );
        }
    }
}

/// Owns the dispatcher worker and the listener registry.
///
/// Dropping the dispatcher stops the worker after it drains what is already
/// queued; [`shutdown`](Self::shutdown) does the same and waits for it.
#[derive(Debug)]
pub struct Dispatcher {
    sink: EventSink,
    registry: ListenerRegistry,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the worker task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = ListenerRegistry::new();
        let stop = CancellationToken::new();

        let worker = tokio::spawn(
            run(rx, registry.clone(), stop.clone()).instrument(info_span!("dispatcher")),
        );

        Self {
            sink: EventSink { tx },
            registry,
            stop,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// A new producer handle.
    #[must_use]
    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Enqueue an event.
    pub fn publish(&self, event: Event) {
        self.sink.publish(event);
    }

    /// Register a listener for all subsequently delivered events.
    pub fn subscribe(&self, listener: impl Listener + 'static) -> ListenerId {
        self.registry.add(Arc::new(listener))
    }

    /// Register an already shared listener.
    pub fn subscribe_shared(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.registry.add(listener)
    }

    /// Remove a listener; returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.registry.remove(id)
    }

    /// The registry this dispatcher delivers to.
    #[must_use]
    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    /// Close the queue, deliver what is left, and wait for the worker.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(%err, "dispatcher worker failed");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Worker loop: pop, deliver, repeat.
async fn run(
    mut rx: mpsc::UnboundedReceiver<Event>,
    registry: ListenerRegistry,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            event = rx.recv() => match event {
                Some(event) => deliver(&registry, &event),
                None => break,
            },

            () = stop.cancelled() => {
                rx.close();
                while let Some(event) = rx.recv().await {
                    deliver(&registry, &event);
                }
                break;
            }
        }
    }

    debug!("dispatcher worker stopped");
}

/// Hand one event to every listener in a fresh snapshot.
fn deliver(registry: &ListenerRegistry, event: &Event) {
    for (id, listener) in registry.snapshot() {
        let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
        if let Err(panic) = outcome {
            error!(
                listener = %id,
                event = event.name(),
                panic = panic_message(panic.as_ref()),
                "listener panicked during delivery"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
