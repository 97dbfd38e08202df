//! Pipeline coordinator
//!
//! Owns a list of elements and the links between them. Each link is a
//! forwarding task that lives as long as the pipeline.

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bus::{EventBus, EventKind};
use super::element::{Element, Inlet};
use super::health::{ElementHealth, HealthSummary};
use super::state::ElementState;
use super::types::StreamMessage;
use crate::assets::HEALTH_LOG_INTERVAL;
use crate::error::{BridgeError, Result};

/// Position of an element inside its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(usize);

impl ElementId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Pipeline coordinator that manages element lifecycle
pub struct Pipeline {
    elements: Vec<Box<dyn Element>>,
    links: Vec<(ElementId, ElementId)>,
    link_tasks: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
    state: ElementState,
    bus: Option<EventBus>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            links: Vec::new(),
            link_tasks: Vec::new(),
            monitor: None,
            cancel: None,
            state: ElementState::Idle,
            bus: None,
        }
    }

    /// Report lifecycle changes and failures on `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register an element. Registration order is start order.
    pub fn add(&mut self, element: Box<dyn Element>) -> ElementId {
        self.elements.push(element);
        ElementId(self.elements.len() - 1)
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn element(&self, id: ElementId) -> Result<&dyn Element> {
        self.elements
            .get(id.0)
            .map(|e| e.as_ref())
            .ok_or_else(|| BridgeError::InvalidLink(format!("unknown element #{}", id.0)))
    }

    /// Forward everything `from` emits into `to`.
    ///
    /// Each element has at most one upstream and one downstream link, and a
    /// link may not close a cycle.
    pub fn link(&mut self, from: ElementId, to: ElementId) -> Result<()> {
        if self.state != ElementState::Idle {
            return Err(BridgeError::InvalidLink(
                "links must be added before start".into(),
            ));
        }
        let from_name = self.element(from)?.name();
        let to_name = self.element(to)?.name();
        if from == to {
            return Err(BridgeError::InvalidLink(format!(
                "{} cannot feed itself",
                from_name
            )));
        }
        if self.links.iter().any(|(a, _)| *a == from) {
            return Err(BridgeError::InvalidLink(format!(
                "{} already has a downstream link",
                from_name
            )));
        }
        if self.links.iter().any(|(_, b)| *b == to) {
            return Err(BridgeError::InvalidLink(format!(
                "{} already has an upstream link",
                to_name
            )));
        }

        // Walk downstream from `to`; reaching `from` would close a loop
        let mut cursor = to;
        while let Some((_, next)) = self.links.iter().find(|(a, _)| *a == cursor) {
            if *next == from {
                return Err(BridgeError::InvalidLink(format!(
                    "{} -> {} would create a cycle",
                    from_name, to_name
                )));
            }
            cursor = *next;
        }

        self.links.push((from, to));
        debug!("Pipeline: linked {} -> {}", from_name, to_name);
        Ok(())
    }

    /// Write end of an element's inbound queue
    pub fn inlet(&self, id: ElementId) -> Result<Inlet> {
        Ok(self.element(id)?.inlet())
    }

    /// Read end of an element's outbound queue, for elements without a
    /// downstream link
    pub fn take_outlet(&mut self, id: ElementId) -> Result<mpsc::Receiver<StreamMessage>> {
        let linked = self.links.iter().any(|(a, _)| *a == id);
        let element = self
            .elements
            .get_mut(id.0)
            .ok_or_else(|| BridgeError::InvalidLink(format!("unknown element #{}", id.0)))?;
        if linked {
            return Err(BridgeError::InvalidLink(format!(
                "{} output is consumed by a link",
                element.name()
            )));
        }
        element
            .take_outlet()
            .ok_or_else(|| BridgeError::InvalidLink(format!("{} output already taken", element.name())))
    }

    /// Start elements in registration order, then the links.
    ///
    /// If any element fails to start, the ones already running are stopped
    /// again and the error is returned. Outputs are only handed to the links
    /// once every element runs, so a failed start leaves them in place.
    pub async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
        if self.state != ElementState::Idle {
            return Err(BridgeError::InvalidState {
                element: "Pipeline",
                from: self.state.description(),
                to: "Running",
            });
        }

        let cancel = lifetime.child_token();
        for index in 0..self.elements.len() {
            let name = self.elements[index].name();
            if let Err(e) = self.elements[index].start(cancel.child_token()).await {
                error!("Pipeline: {} failed to start: {}", name, e);
                self.report_error(name, &e);
                self.roll_back(index, &cancel).await;
                return Err(e);
            }
            self.report_state(name, self.elements[index].state());
        }

        let links = self.links.clone();
        let mut wiring = Vec::with_capacity(links.len());
        for (from, to) in links {
            let Some(upstream) = self.elements[from.0].take_outlet() else {
                let e = BridgeError::InvalidLink(format!(
                    "{} output already taken",
                    self.elements[from.0].name()
                ));
                self.report_error("Pipeline", &e);
                self.roll_back(self.elements.len(), &cancel).await;
                return Err(e);
            };
            wiring.push((
                self.elements[from.0].name(),
                upstream,
                self.elements[to.0].inlet(),
            ));
        }

        for (from, upstream, downstream) in wiring {
            self.link_tasks
                .push(tokio::spawn(forward(from, upstream, downstream, cancel.clone())));
        }

        let health: Vec<(&'static str, Arc<ElementHealth>)> =
            self.elements.iter().map(|e| (e.name(), e.health())).collect();
        self.monitor = Some(tokio::spawn(log_health(
            health,
            self.bus.clone(),
            cancel.clone(),
        )));

        self.cancel = Some(cancel);
        self.state = ElementState::Running {
            started_at: Instant::now(),
        };
        self.report_state("Pipeline", self.state);
        info!("Pipeline: started {} elements", self.elements.len());
        Ok(())
    }

    /// Stop the first `started` elements again, newest first
    async fn roll_back(&mut self, started: usize, cancel: &CancellationToken) {
        for index in (0..started).rev() {
            let element = &mut self.elements[index];
            if let Err(e) = element.stop().await {
                warn!("Pipeline: rollback stop of {} failed: {}", element.name(), e);
            }
        }
        cancel.cancel();
    }

    /// Stop elements in reverse registration order, then the links.
    ///
    /// Every element is stopped even if an earlier one fails; the first
    /// error is returned. Calling stop again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state.is_stopped() {
            return Ok(());
        }
        self.state = ElementState::Stopping;

        let mut first_error = None;
        for index in (0..self.elements.len()).rev() {
            let name = self.elements[index].name();
            match self.elements[index].stop().await {
                Ok(()) => self.report_state(name, self.elements[index].state()),
                Err(e) => {
                    error!("Pipeline: failed to stop {}: {}", name, e);
                    self.report_error(name, &e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        join_all(self.link_tasks.drain(..)).await;
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
        }

        self.state = ElementState::Stopped;
        self.report_state("Pipeline", self.state);
        info!("Pipeline: stopped");
        first_error.map_or(Ok(()), Err)
    }

    fn report_state(&self, element: &str, state: ElementState) {
        if let Some(bus) = &self.bus {
            bus.publish_kind(
                EventKind::StateChange,
                json!({ "element": element, "state": state.description() }),
            );
        }
    }

    fn report_error(&self, element: &str, e: &BridgeError) {
        if let Some(bus) = &self.bus {
            bus.publish_kind(
                EventKind::Error,
                json!({ "element": element, "error": e.to_string() }),
            );
        }
    }

    pub fn health_report(&self) -> Vec<(&'static str, HealthSummary)> {
        self.elements
            .iter()
            .map(|e| (e.name(), e.health().summary()))
            .collect()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Link task: move messages from one element's output to the next one's input.
///
/// Closes the downstream inlet when the upstream output ends.
async fn forward(
    from: &'static str,
    mut upstream: mpsc::Receiver<StreamMessage>,
    downstream: Inlet,
    cancel: CancellationToken,
) {
    let mut forwarded = 0u64;
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = upstream.recv() => msg,
        };
        let Some(msg) = msg else {
            debug!("Link {} -> {}: upstream ended", from, downstream.element());
            break;
        };
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = downstream.send(msg) => sent,
        };
        if let Err(e) = sent {
            warn!("Link {} -> {}: {}", from, downstream.element(), e);
            break;
        }
        forwarded += 1;
    }

    downstream.close();
    debug!(
        "Link {} -> {}: finished after {} messages",
        from,
        downstream.element(),
        forwarded
    );
}

/// Periodic health log; new unit failures since the last round are also
/// raised as warnings on the bus
async fn log_health(
    health: Vec<(&'static str, Arc<ElementHealth>)>,
    bus: Option<EventBus>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
    let mut failures = vec![0u64; health.len()];
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                for ((name, element), seen) in health.iter().zip(failures.iter_mut()) {
                    let summary = element.summary();
                    info!("Pipeline health: {}: {}", name, summary);
                    if summary.unit_failures > *seen {
                        if let Some(bus) = &bus {
                            bus.publish_kind(
                                EventKind::Warning,
                                json!({
                                    "element": name,
                                    "failures": summary.unit_failures - *seen,
                                }),
                            );
                        }
                        *seen = summary.unit_failures;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::element::{ElementCore, Ports, emit, next_message};
    use async_trait::async_trait;

    /// Forwards everything unchanged
    struct Relay {
        core: ElementCore,
        fail_start: bool,
    }

    impl Relay {
        fn new(name: &'static str) -> Self {
            Self {
                core: ElementCore::new(name, 4),
                fail_start: false,
            }
        }
    }

    #[async_trait]
    impl Element for Relay {
        fn name(&self) -> &'static str {
            self.core.name()
        }

        fn inlet(&self) -> Inlet {
            self.core.inlet()
        }

        fn take_outlet(&mut self) -> Option<mpsc::Receiver<StreamMessage>> {
            self.core.take_outlet()
        }

        async fn start(&mut self, lifetime: CancellationToken) -> Result<()> {
            self.core.ensure_idle()?;
            if self.fail_start {
                return Err(BridgeError::InvalidConfig {
                    key: "relay",
                    message: "refused".into(),
                });
            }
            let Ports {
                mut inbound,
                outbound,
                cancel,
            } = self.core.begin(&lifetime)?;
            self.core.spawn(async move {
                while let Some(msg) = next_message(&mut inbound, &cancel).await {
                    if !emit(&outbound, msg, &cancel).await {
                        break;
                    }
                }
            });
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.core.shutdown().await.map(|_| ())
        }

        fn state(&self) -> ElementState {
            self.core.state()
        }

        fn health(&self) -> Arc<ElementHealth> {
            self.core.health()
        }
    }

    fn text_of(msg: StreamMessage) -> String {
        match msg {
            StreamMessage::Text(t) => t.text,
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_chain_preserves_order_and_closes_once() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add(Box::new(Relay::new("A")));
        let b = pipeline.add(Box::new(Relay::new("B")));
        let c = pipeline.add(Box::new(Relay::new("C")));
        pipeline.link(a, b).unwrap();
        pipeline.link(b, c).unwrap();

        let input = pipeline.inlet(a).unwrap();
        let c_inlet = pipeline.inlet(c).unwrap();
        let mut output = pipeline.take_outlet(c).unwrap();

        pipeline.start(CancellationToken::new()).await.unwrap();

        const N: usize = 50;
        let producer = tokio::spawn(async move {
            for i in 0..N {
                input.send(StreamMessage::text(i.to_string())).await.unwrap();
            }
            // End of A's input ends A's output, which ripples down the chain
            input.close();
        });

        for i in 0..N {
            let msg = output.recv().await.unwrap();
            assert_eq!(text_of(msg), i.to_string());
        }
        assert!(output.recv().await.is_none());
        producer.await.unwrap();

        assert!(c_inlet.is_closed());
        assert_eq!(c_inlet.closures(), 1);

        pipeline.stop().await.unwrap();
        assert_eq!(c_inlet.closures(), 1);
        assert_eq!(pipeline.state(), ElementState::Stopped);
    }

    #[tokio::test]
    async fn test_invalid_links_rejected() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add(Box::new(Relay::new("A")));
        let b = pipeline.add(Box::new(Relay::new("B")));
        let c = pipeline.add(Box::new(Relay::new("C")));

        assert!(pipeline.link(a, a).is_err());
        assert!(pipeline.link(a, ElementId(7)).is_err());
        pipeline.link(a, b).unwrap();
        pipeline.link(b, c).unwrap();
        assert!(matches!(pipeline.link(c, a), Err(BridgeError::InvalidLink(_))));
        assert!(pipeline.link(a, c).is_err());
        assert!(pipeline.take_outlet(a).is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_inlets() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add(Box::new(Relay::new("A")));
        let b = pipeline.add(Box::new(Relay::new("B")));
        pipeline.link(a, b).unwrap();
        let input = pipeline.inlet(a).unwrap();

        pipeline.start(CancellationToken::new()).await.unwrap();
        assert!(pipeline.start(CancellationToken::new()).await.is_err());

        pipeline.stop().await.unwrap();
        pipeline.stop().await.unwrap();
        assert!(matches!(
            input.send(StreamMessage::text("late")).await,
            Err(BridgeError::ElementClosed("A"))
        ));
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let mut pipeline = Pipeline::new();
        pipeline.add(Box::new(Relay::new("A")));
        let mut broken = Relay::new("B");
        broken.fail_start = true;
        pipeline.add(Box::new(broken));

        assert!(pipeline.start(CancellationToken::new()).await.is_err());
        let report = pipeline.health_report();
        assert_eq!(report.len(), 2);
        assert_eq!(pipeline.state(), ElementState::Idle);
        assert_eq!(pipeline.elements[0].state(), ElementState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_start_keeps_outputs() {
        let bus = EventBus::new();
        let mut errors = bus.subscribe_channel(EventKind::Error, 4);
        let mut states = bus.subscribe_channel(EventKind::StateChange, 8);

        let mut pipeline = Pipeline::new().with_bus(bus);
        let a = pipeline.add(Box::new(Relay::new("A")));
        let mut broken = Relay::new("B");
        broken.fail_start = true;
        let b = pipeline.add(Box::new(broken));
        pipeline.link(a, b).unwrap();

        assert!(pipeline.start(CancellationToken::new()).await.is_err());
        assert!(pipeline.elements[0].take_outlet().is_some());

        let error = errors.try_recv().unwrap();
        assert_eq!(error.payload["element"], "B");
        let started = states.try_recv().unwrap();
        assert_eq!(started.payload["element"], "A");
        assert_eq!(started.payload["state"], "Running");
    }

    #[tokio::test]
    async fn test_lifecycle_is_published() {
        let bus = EventBus::new();
        let mut states = bus.subscribe_channel(EventKind::StateChange, 8);

        let mut pipeline = Pipeline::new().with_bus(bus);
        let a = pipeline.add(Box::new(Relay::new("A")));
        let b = pipeline.add(Box::new(Relay::new("B")));
        pipeline.link(a, b).unwrap();

        pipeline.start(CancellationToken::new()).await.unwrap();
        pipeline.stop().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = states.try_recv() {
            seen.push(format!(
                "{} {}",
                event.payload["element"].as_str().unwrap(),
                event.payload["state"].as_str().unwrap()
            ));
        }
        assert_eq!(
            seen,
            [
                "A Running",
                "B Running",
                "Pipeline Running",
                "B Stopped",
                "A Stopped",
                "Pipeline Stopped"
            ]
        );
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_workers() {
        let mut pipeline = Pipeline::new();
        let a = pipeline.add(Box::new(Relay::new("A")));
        let mut output = pipeline.take_outlet(a).unwrap();

        let lifetime = CancellationToken::new();
        pipeline.start(lifetime.clone()).await.unwrap();
        lifetime.cancel();

        // Worker observes cancellation and drops its sender
        assert!(output.recv().await.is_none());
        pipeline.stop().await.unwrap();
    }
}
