//! One-stop imports for the common path: registries, the processor, the
//! request/message model, and the in-memory bindings used in tests.

pub use crate::{
    Channel, CommandProcessor, CommandProcessorBuilder, DeferMessage, DispatchError,
    HandlerRegistration, InMemoryBus, InMemoryChannel, InMemoryInbox, InMemoryOutbox,
    InMemoryProducer, InMemoryScheduler, JsonMessageMapper, MapperRegistry, Message,
    MessageMapper, MessagePump, MessageProducer, MessageType, PolicyRegistry, ProducerRegistry,
    PumpConfig, Reactor, Request, RequestContext, RequestHandler, RequestId, RequestKind,
    RoutingKey, ScheduleTime, Scheduler, SubscriberRegistry,
};
