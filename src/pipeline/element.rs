//! Element trait and the plumbing shared by every element
//!
//! An element owns a bounded inbound queue and a bounded outbound queue.
//! Its workers run as tokio tasks under a child of the lifetime token handed
//! to [`Element::start`]; [`Element::stop`] cancels that token, joins every
//! worker and only then lets native resources go.

use async_trait::async_trait;
use log::{error, info};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::health::ElementHealth;
use super::state::ElementState;
use super::types::StreamMessage;
use crate::error::{BridgeError, Result};

/// Trait for pipeline elements
#[async_trait]
pub trait Element: Send + Sync {
    /// Name of this element for logging
    fn name(&self) -> &'static str;

    /// Write end of the inbound queue
    fn inlet(&self) -> Inlet;

    /// Read end of the outbound queue; `None` once taken
    fn take_outlet(&mut self) -> Option<mpsc::Receiver<StreamMessage>>;

    /// Acquire resources and spawn the workers. Returns once they are running.
    async fn start(&mut self, lifetime: CancellationToken) -> Result<()>;

    /// Cancel, join all workers, release resources. Safe to call repeatedly.
    async fn stop(&mut self) -> Result<()>;

    fn state(&self) -> ElementState;

    fn health(&self) -> Arc<ElementHealth>;
}

struct Gate {
    sender: Mutex<Option<mpsc::Sender<StreamMessage>>>,
    closures: AtomicUsize,
}

/// Write end of an element's inbound queue.
///
/// Clones share one gate: once any clone closes it, the element sees the end
/// of its input after draining what was already queued, and every later send
/// fails with [`BridgeError::ElementClosed`].
#[derive(Clone)]
pub struct Inlet {
    element: &'static str,
    gate: Arc<Gate>,
}

impl Inlet {
    fn new(element: &'static str, sender: mpsc::Sender<StreamMessage>) -> Self {
        Self {
            element,
            gate: Arc::new(Gate {
                sender: Mutex::new(Some(sender)),
                closures: AtomicUsize::new(0),
            }),
        }
    }

    pub fn element(&self) -> &'static str {
        self.element
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::Sender<StreamMessage>>> {
        self.gate
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self) -> Result<mpsc::Sender<StreamMessage>> {
        self.lock()
            .clone()
            .ok_or(BridgeError::ElementClosed(self.element))
    }

    /// Queue a message, waiting while the queue is full
    pub async fn send(&self, msg: StreamMessage) -> Result<()> {
        self.sender()?
            .send(msg)
            .await
            .map_err(|_| BridgeError::ElementClosed(self.element))
    }

    /// Queue a message without waiting
    pub fn try_send(&self, msg: StreamMessage) -> Result<()> {
        self.sender()?.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => BridgeError::QueueFull(self.element),
            TrySendError::Closed(_) => BridgeError::ElementClosed(self.element),
        })
    }

    /// Close the queue. Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let closed = self.lock().take().is_some();
        if closed {
            self.gate.closures.fetch_add(1, Ordering::Relaxed);
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// How many times the queue has been closed (0 or 1)
    pub fn closures(&self) -> usize {
        self.gate.closures.load(Ordering::Relaxed)
    }
}

/// Queue ends and cancellation handed to an element's workers at start
pub struct Ports {
    pub inbound: mpsc::Receiver<StreamMessage>,
    pub outbound: mpsc::Sender<StreamMessage>,
    pub cancel: CancellationToken,
}

/// State, queues and worker handles common to all elements.
///
/// Concrete elements embed one and delegate the lifecycle parts of
/// [`Element`] to it.
pub struct ElementCore {
    name: &'static str,
    inlet: Inlet,
    inbound: Option<mpsc::Receiver<StreamMessage>>,
    outbound: Option<mpsc::Sender<StreamMessage>>,
    outlet: Option<mpsc::Receiver<StreamMessage>>,
    state: ElementState,
    cancel: Option<CancellationToken>,
    workers: Vec<JoinHandle<()>>,
    health: Arc<ElementHealth>,
}

impl ElementCore {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        Self {
            name,
            inlet: Inlet::new(name, in_tx),
            inbound: Some(in_rx),
            outbound: Some(out_tx),
            outlet: Some(out_rx),
            state: ElementState::Idle,
            cancel: None,
            workers: Vec::new(),
            health: Arc::new(ElementHealth::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inlet(&self) -> Inlet {
        self.inlet.clone()
    }

    pub fn take_outlet(&mut self) -> Option<mpsc::Receiver<StreamMessage>> {
        self.outlet.take()
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    pub fn health(&self) -> Arc<ElementHealth> {
        self.health.clone()
    }

    fn transition(&mut self, target: ElementState) -> Result<()> {
        if !self.state.can_transition_to(&target) {
            return Err(BridgeError::InvalidState {
                element: self.name,
                from: self.state.description(),
                to: target.description(),
            });
        }
        self.state = target;
        Ok(())
    }

    /// Fails unless the element can still be started.
    ///
    /// Elements call this before acquiring codec contexts.
    pub fn ensure_idle(&self) -> Result<()> {
        if self.state == ElementState::Idle {
            Ok(())
        } else {
            Err(BridgeError::InvalidState {
                element: self.name,
                from: self.state.description(),
                to: "Running",
            })
        }
    }

    /// Move to Running and hand out the queue ends for the workers
    pub fn begin(&mut self, lifetime: &CancellationToken) -> Result<Ports> {
        self.ensure_idle()?;
        let (Some(inbound), Some(outbound)) = (self.inbound.take(), self.outbound.take()) else {
            return Err(BridgeError::ElementClosed(self.name));
        };
        self.transition(ElementState::Running {
            started_at: Instant::now(),
        })?;

        let cancel = lifetime.child_token();
        self.cancel = Some(cancel.clone());
        info!("{}: started", self.name);

        Ok(Ports {
            inbound,
            outbound,
            cancel,
        })
    }

    pub fn spawn<F>(&mut self, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.workers.push(tokio::spawn(worker));
    }

    /// Cancel and join the workers.
    ///
    /// Returns false if the element was already stopped, so callers only
    /// release their own resources once.
    pub async fn shutdown(&mut self) -> Result<bool> {
        match self.state {
            ElementState::Stopping | ElementState::Stopped => return Ok(false),
            ElementState::Idle => {
                self.inlet.close();
                self.inbound = None;
                self.outbound = None;
                self.transition(ElementState::Stopped)?;
                return Ok(true);
            }
            ElementState::Running { .. } => {}
        }

        self.transition(ElementState::Stopping)?;
        self.inlet.close();
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await
                && e.is_panic()
            {
                error!("{}: worker panicked", self.name);
            }
        }

        self.transition(ElementState::Stopped)?;
        info!("{}: stopped ({})", self.name, self.health.summary());
        Ok(true)
    }
}

/// Next inbound message, or `None` once cancelled or the queue has ended
pub async fn next_message(
    inbound: &mut mpsc::Receiver<StreamMessage>,
    cancel: &CancellationToken,
) -> Option<StreamMessage> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        msg = inbound.recv() => msg,
    }
}

/// Send downstream unless cancelled first.
///
/// Returns false when the worker should exit: cancelled, or nobody is left
/// to read the output.
pub async fn emit(
    outbound: &mpsc::Sender<StreamMessage>,
    msg: StreamMessage,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = outbound.send(msg) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inlet_close_once() {
        let core = ElementCore::new("Probe", 4);
        let inlet = core.inlet();
        let other = inlet.clone();

        assert!(!inlet.is_closed());
        assert!(inlet.close());
        assert!(!other.close());
        assert_eq!(inlet.closures(), 1);
        assert!(other.is_closed());
        assert!(matches!(
            other.send(StreamMessage::text("late")).await,
            Err(BridgeError::ElementClosed("Probe"))
        ));
    }

    #[tokio::test]
    async fn test_try_send_reports_full_queue() {
        let core = ElementCore::new("Probe", 1);
        let inlet = core.inlet();
        inlet.try_send(StreamMessage::text("a")).unwrap();
        assert!(matches!(
            inlet.try_send(StreamMessage::text("b")),
            Err(BridgeError::QueueFull("Probe"))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut core = ElementCore::new("Probe", 4);
        let lifetime = CancellationToken::new();

        let ports = core.begin(&lifetime).unwrap();
        assert!(core.state().is_running());
        assert!(core.begin(&lifetime).is_err());

        let Ports {
            mut inbound,
            outbound,
            cancel,
        } = ports;
        core.spawn(async move {
            while let Some(msg) = next_message(&mut inbound, &cancel).await {
                if !emit(&outbound, msg, &cancel).await {
                    break;
                }
            }
        });

        let mut outlet = core.take_outlet().unwrap();
        core.inlet().send(StreamMessage::text("one")).await.unwrap();
        assert!(matches!(outlet.recv().await, Some(StreamMessage::Text(_))));

        assert!(core.shutdown().await.unwrap());
        assert!(!core.shutdown().await.unwrap());
        assert_eq!(core.state(), ElementState::Stopped);
        // Worker exited and dropped the only sender
        assert!(outlet.recv().await.is_none());
        assert!(core.inlet().send(StreamMessage::text("two")).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let mut core = ElementCore::new("Probe", 4);
        assert!(core.shutdown().await.unwrap());
        assert_eq!(core.state(), ElementState::Stopped);
        assert!(core.begin(&CancellationToken::new()).is_err());
        assert!(core.inlet().is_closed());
    }
}
