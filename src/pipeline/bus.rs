//! Best-effort event bus
//!
//! Delivery never blocks the publisher: a subscriber whose channel is full
//! simply misses that event. Before [`EventBus::start`] (and after
//! [`EventBus::stop`]) events are delivered inline by `publish`; while
//! started they go through a bounded queue drained by a background task.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assets::EVENT_QUEUE_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Error,
    Warning,
    StateChange,
    PartialResult,
    FinalResult,
    /// The remote speaker interrupted the AI; queued playout is discarded
    BargeIn,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}

type Subscribers = HashMap<EventKind, Vec<mpsc::Sender<Event>>>;

struct Dispatcher {
    queue: mpsc::Sender<Event>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

struct Inner {
    subscribers: RwLock<Subscribers>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

/// Cheaply clonable handle to one bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self, kind: EventKind, sink: mpsc::Sender<Event>) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.entry(kind).or_default().push(sink);
    }

    /// Subscribe with a fresh channel of `capacity` events
    pub fn subscribe_channel(&self, kind: EventKind, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe(kind, tx);
        rx
    }

    /// Remove `sink` from `kind`. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, kind: EventKind, sink: &mpsc::Sender<Event>) -> bool {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sinks) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = sinks.len();
        sinks.retain(|s| !s.same_channel(sink));
        let removed = sinks.len() != before;
        if sinks.is_empty() {
            subscribers.remove(&kind);
        }
        removed
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver `event` to every subscriber of its kind. Never blocks.
    pub fn publish(&self, event: Event) {
        let queue = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|d| d.queue.clone());

        match queue {
            Some(queue) => match queue.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    warn!("EventBus: dispatch queue full, dropping {:?} event", event.kind)
                }
                // Dispatcher is shutting down; deliver ourselves
                Err(TrySendError::Closed(event)) => deliver(&self.inner.subscribers, event),
            },
            None => deliver(&self.inner.subscribers, event),
        }
    }

    pub fn publish_kind(&self, kind: EventKind, payload: serde_json::Value) {
        self.publish(Event::new(kind, payload));
    }

    pub fn is_started(&self) -> bool {
        self.inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Switch to queued dispatch. A no-op if already started.
    pub fn start(&self, lifetime: &CancellationToken) {
        let mut dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if dispatcher.is_some() {
            return;
        }

        let (queue, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let cancel = lifetime.child_token();
        let worker = tokio::spawn(dispatch(self.inner.clone(), rx, cancel.clone()));
        *dispatcher = Some(Dispatcher {
            queue,
            cancel,
            worker,
        });
        debug!("EventBus: started");
    }

    /// Back to inline dispatch; events still queued are delivered first
    pub async fn stop(&self) {
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel.cancel();
            let _ = dispatcher.worker.await;
            debug!("EventBus: stopped");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(subscribers: &RwLock<Subscribers>, event: Event) {
    let mut closed = false;
    {
        let subscribers = subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sinks) = subscribers.get(&event.kind) else {
            return;
        };
        for sink in sinks {
            match sink.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("EventBus: subscriber full, dropping {:?} event", event.kind)
                }
                Err(TrySendError::Closed(_)) => closed = true,
            }
        }
    }

    if closed {
        let mut subscribers = subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sinks) = subscribers.get_mut(&event.kind) {
            sinks.retain(|s| !s.is_closed());
        }
    }
}

async fn dispatch(inner: Arc<Inner>, mut rx: mpsc::Receiver<Event>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => deliver(&inner.subscribers, event),
                None => break,
            },
        }
    }

    rx.close();
    while let Ok(event) = rx.try_recv() {
        deliver(&inner.subscribers, event);
    }
}
