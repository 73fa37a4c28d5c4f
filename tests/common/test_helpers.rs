//! Shared fixtures for the integration suite: request types, recording and
//! misbehaving handlers, and a flaky producer.

use async_trait::async_trait;
use courier::{
    ChannelError, DeferMessage, DispatchError, HandlerRegistration, InMemoryBus,
    InMemoryProducer, Message, MessageProducer, Request, RequestContext, RequestHandler,
    RequestId, RequestKind,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Route crate logging through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MyCommand {
    pub id: RequestId,
}

impl MyCommand {
    pub fn new(id: &str) -> Self {
        Self { id: RequestId::new(id) }
    }
}

impl Request for MyCommand {
    fn id(&self) -> &RequestId {
        &self.id
    }

    fn kind(&self) -> RequestKind {
        RequestKind::Command
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MyEvent {
    pub id: RequestId,
}

impl MyEvent {
    pub fn new(id: &str) -> Self {
        Self { id: RequestId::new(id) }
    }
}

impl Request for MyEvent {
    fn id(&self) -> &RequestId {
        &self.id
    }

    fn kind(&self) -> RequestKind {
        RequestKind::Event
    }
}

/// Collects `(handler name, request id)` pairs across handlers and tasks.
#[derive(Clone, Default)]
pub struct Recorder {
    received: Arc<Mutex<Vec<(String, String)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, handler: &str, request_id: &RequestId) {
        self.received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((handler.to_string(), request_id.to_string()));
    }

    pub fn received(&self) -> Vec<(String, String)> {
        self.received.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn contains(&self, handler: &str, request_id: &str) -> bool {
        self.received().iter().any(|(h, id)| h == handler && id == request_id)
    }

    pub fn count(&self) -> usize {
        self.received().len()
    }

    /// Poll until at least `n` records arrive or the timeout passes.
    pub async fn wait_for_count(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count() >= n
    }
}

/// Handler that records what it saw and succeeds.
pub struct RecordingHandler<R> {
    name: &'static str,
    recorder: Recorder,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<R: Request + Clone> RecordingHandler<R> {
    pub fn registration(name: &'static str, recorder: &Recorder) -> HandlerRegistration<R> {
        let recorder = recorder.clone();
        HandlerRegistration::new(name, move || {
            Ok(Arc::new(RecordingHandler {
                name,
                recorder: recorder.clone(),
                _marker: std::marker::PhantomData,
            }))
        })
    }
}

#[async_trait]
impl<R: Request + Clone> RequestHandler<R> for RecordingHandler<R> {
    async fn handle(&self, request: R, _ctx: &RequestContext) -> Result<R, DispatchError> {
        self.recorder.record(self.name, request.id());
        Ok(request)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("handler refused the request")]
pub struct HandlerRefused;

/// Handler that always fails with an application error.
pub struct FailingHandler;

impl FailingHandler {
    pub fn registration<R: Request + Clone>(name: &'static str) -> HandlerRegistration<R> {
        HandlerRegistration::new(name, move || Ok(Arc::new(FailingHandler)))
    }
}

#[async_trait]
impl<R: Request + Clone> RequestHandler<R> for FailingHandler {
    async fn handle(&self, _request: R, _ctx: &RequestContext) -> Result<R, DispatchError> {
        Err(DispatchError::app(HandlerRefused))
    }
}

/// Handler that defers every delivery, recording the handled count the
/// originating message carried on each attempt.
pub struct DeferringHandler {
    pub deliveries: Arc<Mutex<Vec<u32>>>,
}

impl DeferringHandler {
    pub fn registration<R: Request + Clone>(
        name: &'static str,
        deliveries: &Arc<Mutex<Vec<u32>>>,
    ) -> HandlerRegistration<R> {
        let deliveries = deliveries.clone();
        HandlerRegistration::new(name, move || {
            Ok(Arc::new(DeferringHandler { deliveries: deliveries.clone() }))
        })
    }
}

#[async_trait]
impl<R: Request + Clone> RequestHandler<R> for DeferringHandler {
    async fn handle(&self, _request: R, ctx: &RequestContext) -> Result<R, DispatchError> {
        let handled_count = ctx.origin().map(|h| h.handled_count).unwrap_or(0);
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handled_count);
        Err(DispatchError::Defer(DeferMessage::new()))
    }
}

/// Producer that fails while unhealthy and records to a bus once healed.
pub struct FaultyProducer {
    healthy: Arc<AtomicBool>,
    bus: InMemoryBus,
}

impl FaultyProducer {
    pub fn new(bus: InMemoryBus) -> (Self, Arc<AtomicBool>) {
        let healthy = Arc::new(AtomicBool::new(false));
        (Self { healthy: healthy.clone(), bus }, healthy)
    }
}

#[async_trait]
impl MessageProducer for FaultyProducer {
    async fn send(&self, message: &Message) -> Result<Option<String>, ChannelError> {
        if self.healthy.load(Ordering::SeqCst) {
            InMemoryProducer::new(self.bus.clone()).send(message).await
        } else {
            Err(ChannelError::Io("broker unreachable".into()))
        }
    }
}
