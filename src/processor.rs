//! The command processor: the front door applications dispatch through.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::DispatchError;
use crate::mapper::MapperRegistry;
use crate::mediator::{OutboxMediator, OutboxSweeper, SweepConfig};
use crate::message::MessageId;
use crate::outbox::{InMemoryOutbox, Outbox, OutboxTransaction};
use crate::pipeline::{HandlerRegistration, RequestHandler};
use crate::policy::PolicyRegistry;
use crate::producer::ProducerRegistry;
use crate::request::{Request, RequestContext};
use crate::scheduler::{
    DispatchKind, DispatchSink, ErasedDispatch, FireScheduledRequest, ScheduleTime, Scheduler,
    SchedulerId,
};
use crate::subscriber::{DispatchMode, SubscriberRegistry};

const DEFAULT_CLEAR_BATCH: usize = 100;

struct ProcessorInner {
    subscribers: SubscriberRegistry,
    mappers: MapperRegistry,
    mediator: Arc<OutboxMediator>,
    scheduler: Option<Arc<dyn Scheduler>>,
    context_key: Option<String>,
    sweeper: Mutex<Option<OutboxSweeper>>,
}

/// Front-door dispatch API: send, publish, post, outbox staging, and
/// deferred variants of all three. Cheap to clone; clones share one
/// processor.
#[derive(Clone)]
pub struct CommandProcessor {
    inner: Arc<ProcessorInner>,
}

impl CommandProcessor {
    pub fn builder() -> CommandProcessorBuilder {
        CommandProcessorBuilder::new()
    }

    /// Dispatch a command to its single registered handler pipeline.
    pub async fn send<R: Request + Clone>(&self, request: R) -> Result<(), DispatchError> {
        let ctx = context_for(&request);
        self.send_with_context(request, &ctx).await
    }

    /// [`send`](Self::send) with a caller-supplied context (pumps pass the
    /// originating message's context).
    pub async fn send_with_context<R: Request + Clone>(
        &self,
        request: R,
        ctx: &RequestContext,
    ) -> Result<(), DispatchError> {
        let registration = self.inner.subscribers.lookup::<R>().ok_or_else(|| {
            DispatchError::configuration(format!(
                "no handler registered for {}; send expects exactly one",
                std::any::type_name::<R>()
            ))
        })?;
        if registration.mode() != DispatchMode::Send || registration.handlers().len() != 1 {
            return Err(DispatchError::configuration(format!(
                "{} is registered for fan-out; send expects exactly one handler",
                std::any::type_name::<R>()
            )));
        }

        tracing::debug!(request_id = %request.id(), "send");
        let chain = registration.handlers()[0].build_chain()?;
        chain.handle(request, ctx).await.map(|_| ())
    }

    /// Dispatch an event or document to every registered handler pipeline.
    /// All pipelines run; failures are collected and raised together.
    pub async fn publish<R: Request + Clone>(&self, request: R) -> Result<(), DispatchError> {
        let ctx = context_for(&request);
        self.publish_with_context(request, &ctx).await
    }

    /// [`publish`](Self::publish) with a caller-supplied context.
    pub async fn publish_with_context<R: Request + Clone>(
        &self,
        request: R,
        ctx: &RequestContext,
    ) -> Result<(), DispatchError> {
        let Some(registration) = self.inner.subscribers.lookup::<R>() else {
            tracing::debug!(request_id = %request.id(), "publish with no subscribers");
            return Ok(());
        };
        if registration.mode() != DispatchMode::Publish {
            return Err(DispatchError::configuration(format!(
                "{} is registered for send; publish fans out",
                std::any::type_name::<R>()
            )));
        }

        tracing::debug!(
            request_id = %request.id(),
            handlers = registration.handlers().len(),
            "publish"
        );
        let mut failures = Vec::new();
        for handler in registration.handlers() {
            match handler.build_chain() {
                Ok(chain) => {
                    if let Err(e) = chain.handle(request.clone(), ctx).await {
                        failures.push(e);
                    }
                }
                Err(e) => failures.push(e),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Aggregate(failures))
        }
    }

    /// Wrap the request into a message, stage it in the outbox, and attempt
    /// immediate dispatch. A dispatch failure does not fail the post: the
    /// staged entry survives and the sweeper retries it.
    pub async fn post<R: Request + Clone>(&self, request: R) -> Result<MessageId, DispatchError> {
        let id = self.deposit_post(request, None).await?;
        if let Err(e) = self.inner.mediator.clear(std::slice::from_ref(&id)).await {
            tracing::warn!(message_id = %id, error = %e, "post dispatch failed; sweep will retry");
        }
        Ok(id)
    }

    /// Stage a request into the outbox without dispatching, optionally under
    /// the caller's transaction. Returns the staged message id.
    pub async fn deposit_post<R: Request + Clone>(
        &self,
        request: R,
        txn: Option<&mut dyn OutboxTransaction>,
    ) -> Result<MessageId, DispatchError> {
        let ctx = context_for(&request);
        let pipeline = self.inner.mappers.wrap_pipeline::<R>()?;
        let message = pipeline.wrap(&request, &ctx).await?;
        let mut ids = self
            .inner
            .mediator
            .deposit(vec![message], self.inner.context_key.as_deref(), txn)
            .await?;
        match ids.pop() {
            Some(id) => Ok(id),
            None => unreachable!("depositing one message yields one id"),
        }
    }

    /// Force dispatch of specific staged entries, in order.
    pub async fn clear_outbox(&self, ids: &[MessageId]) -> Result<(), DispatchError> {
        self.inner.mediator.clear(ids).await
    }

    /// Dispatch outstanding entries at least `older_than` old. Returns how
    /// many were dispatched.
    pub async fn clear_outstanding_from_outbox(
        &self,
        older_than: Duration,
    ) -> Result<usize, DispatchError> {
        self.inner.mediator.clear_outstanding(older_than, DEFAULT_CLEAR_BATCH).await
    }

    /// Send after a delay.
    pub async fn send_after<R: Request + Clone>(
        &self,
        request: R,
        delay: Duration,
    ) -> Result<SchedulerId, DispatchError> {
        self.schedule(DispatchKind::Send, request, ScheduleTime::Delay(delay)).await
    }

    /// Send at an absolute time.
    pub async fn send_at<R: Request + Clone>(
        &self,
        request: R,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SchedulerId, DispatchError> {
        self.schedule(DispatchKind::Send, request, ScheduleTime::At(at)).await
    }

    /// Publish after a delay.
    pub async fn publish_after<R: Request + Clone>(
        &self,
        request: R,
        delay: Duration,
    ) -> Result<SchedulerId, DispatchError> {
        self.schedule(DispatchKind::Publish, request, ScheduleTime::Delay(delay)).await
    }

    /// Publish at an absolute time.
    pub async fn publish_at<R: Request + Clone>(
        &self,
        request: R,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SchedulerId, DispatchError> {
        self.schedule(DispatchKind::Publish, request, ScheduleTime::At(at)).await
    }

    /// Post after a delay. Scheduled sends and publishes stay in-process;
    /// only a post touches the outbox, and only when it fires.
    pub async fn post_after<R: Request + Clone>(
        &self,
        request: R,
        delay: Duration,
    ) -> Result<SchedulerId, DispatchError> {
        self.schedule(DispatchKind::Post, request, ScheduleTime::Delay(delay)).await
    }

    /// Post at an absolute time.
    pub async fn post_at<R: Request + Clone>(
        &self,
        request: R,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SchedulerId, DispatchError> {
        self.schedule(DispatchKind::Post, request, ScheduleTime::At(at)).await
    }

    /// Move a pending schedule to a new due time.
    pub async fn reschedule(
        &self,
        id: &SchedulerId,
        when: ScheduleTime,
    ) -> Result<bool, DispatchError> {
        self.scheduler()?.reschedule(id, when).await
    }

    /// Cancel a pending schedule.
    pub async fn cancel_scheduled(&self, id: &SchedulerId) -> Result<bool, DispatchError> {
        self.scheduler()?.cancel(id).await
    }

    /// Stop background work (the outbox sweeper). Idempotent.
    pub async fn shutdown(&self) {
        let sweeper = {
            let mut guard =
                self.inner.sweeper.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
    }

    pub(crate) fn mappers(&self) -> &MapperRegistry {
        &self.inner.mappers
    }

    fn scheduler(&self) -> Result<&Arc<dyn Scheduler>, DispatchError> {
        self.inner
            .scheduler
            .as_ref()
            .ok_or_else(|| DispatchError::configuration("no scheduler configured"))
    }

    async fn schedule<R: Request + Clone>(
        &self,
        kind: DispatchKind,
        request: R,
        when: ScheduleTime,
    ) -> Result<SchedulerId, DispatchError> {
        let scheduler = self.scheduler()?;
        let wrapper = FireScheduledRequest::new(kind, Arc::new(TypedDispatch { request }));
        scheduler.schedule(wrapper, when).await
    }
}

#[async_trait]
impl DispatchSink for CommandProcessor {
    async fn fire(&self, request: FireScheduledRequest) -> Result<(), DispatchError> {
        self.send(request).await
    }
}

/// Sink bound to schedulers: holds the processor weakly so a dropped
/// processor is not pinned by its scheduler backend.
struct WeakSink {
    inner: Weak<ProcessorInner>,
}

#[async_trait]
impl DispatchSink for WeakSink {
    async fn fire(&self, request: FireScheduledRequest) -> Result<(), DispatchError> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| DispatchError::configuration("processor has shut down"))?;
        CommandProcessor { inner }.send(request).await
    }
}

fn context_for<R: Request>(request: &R) -> RequestContext {
    match request.correlation_id() {
        Some(correlation_id) => RequestContext::new().with_correlation_id(correlation_id),
        None => RequestContext::new(),
    }
}

/// Holds the concrete request a schedule will re-dispatch.
struct TypedDispatch<R: Request + Clone> {
    request: R,
}

#[async_trait]
impl<R: Request + Clone> ErasedDispatch for TypedDispatch<R> {
    async fn dispatch(
        &self,
        kind: DispatchKind,
        processor: &CommandProcessor,
    ) -> Result<(), DispatchError> {
        match kind {
            DispatchKind::Send => processor.send(self.request.clone()).await,
            DispatchKind::Publish => processor.publish(self.request.clone()).await,
            DispatchKind::Post => processor.post(self.request.clone()).await.map(|_| ()),
        }
    }
}

/// Handler for the scheduler's wrapper request: re-enters the processor
/// with the operation the schedule was created for.
struct FireScheduledHandler {
    inner: Weak<ProcessorInner>,
}

#[async_trait]
impl RequestHandler<FireScheduledRequest> for FireScheduledHandler {
    async fn handle(
        &self,
        request: FireScheduledRequest,
        _ctx: &RequestContext,
    ) -> Result<FireScheduledRequest, DispatchError> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| DispatchError::configuration("processor has shut down"))?;
        let processor = CommandProcessor { inner };
        let dispatch = request.dispatch.clone();
        dispatch.dispatch(request.dispatch_kind(), &processor).await?;
        Ok(request)
    }
}

/// Assembles a [`CommandProcessor`] from its registries and stores.
pub struct CommandProcessorBuilder {
    subscribers: SubscriberRegistry,
    mappers: MapperRegistry,
    policies: Option<Arc<PolicyRegistry>>,
    producers: ProducerRegistry,
    outbox: Option<Arc<dyn Outbox>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    context_key: Option<String>,
    sweep: Option<SweepConfig>,
}

impl Default for CommandProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandProcessorBuilder {
    pub fn new() -> Self {
        Self {
            subscribers: SubscriberRegistry::new(),
            mappers: MapperRegistry::new(),
            policies: None,
            producers: ProducerRegistry::new(),
            outbox: None,
            scheduler: None,
            context_key: None,
            sweep: None,
        }
    }

    pub fn subscribers(mut self, subscribers: SubscriberRegistry) -> Self {
        self.subscribers = subscribers;
        self
    }

    pub fn mappers(mut self, mappers: MapperRegistry) -> Self {
        self.mappers = mappers;
        self
    }

    /// Policies default to [`PolicyRegistry::with_defaults`] when not set.
    pub fn policies(mut self, policies: Arc<PolicyRegistry>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn producers(mut self, producers: ProducerRegistry) -> Self {
        self.producers = producers;
        self
    }

    /// The outbox defaults to an [`InMemoryOutbox`] when not set.
    pub fn outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Context key stamped on outbox entries deposited by this processor.
    pub fn context_key(mut self, context_key: impl Into<String>) -> Self {
        self.context_key = Some(context_key.into());
        self
    }

    /// Run a background sweeper with this configuration. Requires a running
    /// tokio runtime at build time.
    pub fn sweep(mut self, config: SweepConfig) -> Self {
        self.sweep = Some(config);
        self
    }

    /// Build the processor, register the scheduler plumbing, and start the
    /// sweeper when one was configured.
    pub fn build(self) -> Result<CommandProcessor, DispatchError> {
        let policies =
            self.policies.unwrap_or_else(|| Arc::new(PolicyRegistry::with_defaults()));
        let producers = Arc::new(self.producers);
        let outbox: Arc<dyn Outbox> =
            self.outbox.unwrap_or_else(|| Arc::new(InMemoryOutbox::new()));
        let mediator = Arc::new(OutboxMediator::new(outbox, producers, policies));

        let mut subscribers = self.subscribers;
        let mut registration_error = None;
        let inner = Arc::new_cyclic(|weak: &Weak<ProcessorInner>| {
            let handler: Arc<dyn RequestHandler<FireScheduledRequest>> =
                Arc::new(FireScheduledHandler { inner: weak.clone() });
            if let Err(e) = subscribers.register_send::<FireScheduledRequest>(
                HandlerRegistration::of_instance("FireScheduledHandler", handler),
            ) {
                registration_error = Some(e);
            }
            ProcessorInner {
                subscribers: std::mem::take(&mut subscribers),
                mappers: self.mappers,
                mediator: mediator.clone(),
                scheduler: self.scheduler,
                context_key: self.context_key,
                sweeper: Mutex::new(None),
            }
        });
        if let Some(e) = registration_error {
            return Err(e);
        }

        let processor = CommandProcessor { inner };
        if let Some(scheduler) = &processor.inner.scheduler {
            // A weak sink: the scheduler must not keep the processor alive.
            scheduler.bind(Arc::new(WeakSink { inner: Arc::downgrade(&processor.inner) }));
        }
        if let Some(config) = self.sweep {
            let sweeper = OutboxSweeper::start(mediator, config);
            *processor
                .inner
                .sweeper
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sweeper);
        }
        Ok(processor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestId, RequestKind};
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Debug)]
    struct Tick {
        id: RequestId,
    }

    impl Request for Tick {
        fn id(&self) -> &RequestId {
            &self.id
        }

        fn kind(&self) -> RequestKind {
            RequestKind::Command
        }
    }

    struct Recorder {
        seen: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl RequestHandler<Tick> for Recorder {
        async fn handle(&self, request: Tick, _ctx: &RequestContext) -> Result<Tick, DispatchError> {
            self.seen.lock().unwrap().push(request.id.to_string());
            Ok(request)
        }
    }

    #[tokio::test]
    async fn send_without_registration_is_a_configuration_error() {
        let processor = CommandProcessor::builder().build().unwrap();
        let err = processor.send(Tick { id: RequestId::new("t") }).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn publish_without_registration_is_a_quiet_no_op() {
        let processor = CommandProcessor::builder().build().unwrap();
        // Tick is unregistered, so fan-out reaches zero handlers.
        processor.publish(Tick { id: RequestId::new("t") }).await.unwrap();
    }

    #[tokio::test]
    async fn publish_on_a_send_registration_is_rejected() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let mut subscribers = SubscriberRegistry::new();
        let handler_seen = seen.clone();
        subscribers
            .register_send::<Tick>(HandlerRegistration::new("Recorder", move || {
                Ok(Arc::new(Recorder { seen: handler_seen.clone() }))
            }))
            .unwrap();

        let processor = CommandProcessor::builder().subscribers(subscribers).build().unwrap();
        let err = processor.publish(Tick { id: RequestId::new("t") }).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduling_without_a_scheduler_is_a_configuration_error() {
        let processor = CommandProcessor::builder().build().unwrap();
        let err = processor
            .send_after(Tick { id: RequestId::new("t") }, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let processor = CommandProcessor::builder().build().unwrap();
        processor.shutdown().await;
        processor.shutdown().await;
    }
}
