#![forbid(unsafe_code)]

//! # Courier
//!
//! Command and event dispatch runtime for async Rust: typed handler
//! pipelines with declared middleware, a transactional outbox with
//! retry/circuit-breaker dispatch, and broker message pumps.
//!
//! ## The pieces
//!
//! - **Requests** are commands (exactly one handler), events, or documents
//!   (fan-out). Handlers compose into per-request chains with declared
//!   middleware: retry, circuit breaker, logging, validation, fallback, and
//!   an inbox guard for once-only handling.
//! - **Messages** are the wire/outbox shape of a request. Mappers and
//!   transforms wrap requests to messages on the way out and unwrap them on
//!   the way in.
//! - **The command processor** is the front door: `send`, `publish`, `post`
//!   (outbox-backed), explicit outbox staging, and scheduled variants.
//! - **The outbox mediator** stages messages with business state and pushes
//!   them through producers, retried inside a circuit breaker; a background
//!   sweeper re-attempts anything left outstanding.
//! - **Message pumps** consume broker channels, translate messages back
//!   into requests, and dispatch them with acknowledge / reject / requeue
//!   semantics. Run them as tasks or on dedicated reactor threads.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use courier::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     id: RequestId,
//! }
//!
//! impl Request for OrderPlaced {
//!     fn id(&self) -> &RequestId {
//!         &self.id
//!     }
//!
//!     fn kind(&self) -> RequestKind {
//!         RequestKind::Event
//!     }
//! }
//!
//! struct Bill;
//!
//! #[async_trait]
//! impl RequestHandler<OrderPlaced> for Bill {
//!     async fn handle(
//!         &self,
//!         request: OrderPlaced,
//!         _ctx: &RequestContext,
//!     ) -> Result<OrderPlaced, DispatchError> {
//!         println!("billing {}", request.id());
//!         Ok(request)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), DispatchError> {
//!     let mut subscribers = SubscriberRegistry::new();
//!     subscribers.register_publish(HandlerRegistration::<OrderPlaced>::of_instance(
//!         "Bill",
//!         Arc::new(Bill),
//!     ))?;
//!
//!     let mut mappers = MapperRegistry::new();
//!     mappers.register::<OrderPlaced, _>(JsonMessageMapper::new(RoutingKey::new("orders")));
//!
//!     let bus = InMemoryBus::new();
//!     let mut producers = ProducerRegistry::new();
//!     producers.register(RoutingKey::new("orders"), InMemoryProducer::new(bus.clone()));
//!
//!     let processor = CommandProcessor::builder()
//!         .subscribers(subscribers)
//!         .mappers(mappers)
//!         .producers(producers)
//!         .build()?;
//!
//!     // In-process fan-out.
//!     processor.publish(OrderPlaced { id: RequestId::new("o-1") }).await?;
//!     // Outbox-backed: staged durably, then dispatched to the bus.
//!     processor.post(OrderPlaced { id: RequestId::new("o-2") }).await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod channel;
mod circuit_breaker;
mod clock;
mod error;
mod inbox;
mod mapper;
mod mediator;
mod message;
mod outbox;
mod pipeline;
mod policy;
mod processor;
mod producer;
mod pump;
mod request;
mod retry;
mod scheduler;
mod sleeper;
mod subscriber;

pub use backoff::{Backoff, Jitter};
pub use channel::{Channel, ChannelStats, InMemoryChannel, InMemorySender};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ChannelError, DeferMessage, DispatchError, StoreError};
pub use inbox::{InMemoryInbox, Inbox, InboxEntry};
pub use mapper::{
    JsonMessageMapper, MapperRegistry, MessageMapper, MessageTransform, TransformDescriptor,
    UnwrapPipeline, WrapPipeline,
};
pub use mediator::{OutboxMediator, OutboxSweeper, SweepConfig};
pub use message::{
    CloudEventAttributes, Message, MessageBody, MessageHeader, MessageId, MessageType, RoutingKey,
};
pub use outbox::{
    InMemoryOutbox, InMemoryTransaction, InMemoryTransactionProvider, Outbox, OutboxEntry,
    OutboxState, OutboxTransaction, TransactionProvider,
};
pub use pipeline::{
    CircuitBreakerMiddleware, FallbackMiddleware, HandlerRegistration, InboxMiddleware,
    LoggingMiddleware, MiddlewareDescriptor, OnceOnlyAction, RequestHandler, RetryMiddleware,
    StepTiming, ValidationFailure, ValidationMiddleware,
};
pub use policy::{
    PolicyError, PolicyRegistry, ResiliencePolicy, CIRCUIT_BREAKER, CIRCUIT_BREAKER_ASYNC,
    RETRY_POLICY, RETRY_POLICY_ASYNC,
};
pub use processor::{CommandProcessor, CommandProcessorBuilder};
pub use producer::{
    InMemoryBus, InMemoryProducer, MessageProducer, ProducerCapabilities, ProducerRegistry,
};
pub use pump::{MessagePump, PumpConfig, Reactor, ReactorHandle};
pub use request::{Request, RequestContext, RequestId, RequestKind};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use scheduler::{
    DispatchKind, DispatchSink, FireScheduledRequest, InMemoryScheduler, ScheduleTime, Scheduler,
    SchedulerId,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use subscriber::{DispatchMode, SubscriberRegistry, TypeRegistration};

pub mod prelude;
