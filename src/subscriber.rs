//! Maps request types to their registered handler pipelines.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;

use crate::error::DispatchError;
use crate::pipeline::HandlerRegistration;
use crate::request::Request;

/// How a request type dispatches: one handler exactly, or fan-out to
/// however many are registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    Send,
    Publish,
}

/// Registrations for one request type.
pub struct TypeRegistration<R: Request> {
    mode: DispatchMode,
    handlers: Vec<HandlerRegistration<R>>,
}

impl<R: Request> TypeRegistration<R> {
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Registered handlers in declaration order.
    pub fn handlers(&self) -> &[HandlerRegistration<R>] {
        &self.handlers
    }
}

/// Request type → handler registrations. Written during startup through
/// `&mut`, then shared read-only with dispatchers and pumps.
#[derive(Default)]
pub struct SubscriberRegistry {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SubscriberRegistry{{types:{}}}", self.entries.len())
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single handler a command dispatches to. Registering a
    /// second handler for the same type is a configuration error.
    pub fn register_send<R: Request>(
        &mut self,
        registration: HandlerRegistration<R>,
    ) -> Result<&mut Self, DispatchError> {
        let key = TypeId::of::<R>();
        if self.entries.contains_key(&key) {
            return Err(DispatchError::configuration(format!(
                "{} already has a handler registered; commands take exactly one",
                type_name::<R>()
            )));
        }
        self.entries.insert(
            key,
            Box::new(TypeRegistration::<R> {
                mode: DispatchMode::Send,
                handlers: vec![registration],
            }),
        );
        Ok(self)
    }

    /// Add a fan-out handler for an event or document type. Repeated calls
    /// append in declaration order.
    pub fn register_publish<R: Request>(
        &mut self,
        registration: HandlerRegistration<R>,
    ) -> Result<&mut Self, DispatchError> {
        let key = TypeId::of::<R>();
        match self.entries.get_mut(&key) {
            None => {
                self.entries.insert(
                    key,
                    Box::new(TypeRegistration::<R> {
                        mode: DispatchMode::Publish,
                        handlers: vec![registration],
                    }),
                );
            }
            Some(entry) => {
                let existing = entry
                    .downcast_mut::<TypeRegistration<R>>()
                    .expect("registry entry keyed by TypeId always downcasts");
                if existing.mode == DispatchMode::Send {
                    return Err(DispatchError::configuration(format!(
                        "{} is registered for send; it cannot also fan out",
                        type_name::<R>()
                    )));
                }
                existing.handlers.push(registration);
            }
        }
        Ok(self)
    }

    /// Registrations for `R`, if any.
    pub fn lookup<R: Request>(&self) -> Option<&TypeRegistration<R>> {
        self.entries
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.downcast_ref::<TypeRegistration<R>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RequestHandler;
    use crate::request::{RequestContext, RequestId, RequestKind};
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Clone, Debug)]
    struct Order {
        id: RequestId,
    }

    impl Request for Order {
        fn id(&self) -> &RequestId {
            &self.id
        }

        fn kind(&self) -> RequestKind {
            RequestKind::Command
        }
    }

    struct Noop;

    #[async_trait]
    impl RequestHandler<Order> for Noop {
        async fn handle(
            &self,
            request: Order,
            _ctx: &RequestContext,
        ) -> Result<Order, DispatchError> {
            Ok(request)
        }
    }

    fn noop(name: &'static str) -> HandlerRegistration<Order> {
        HandlerRegistration::of_instance(name, Arc::new(Noop))
    }

    #[test]
    fn send_registration_is_exclusive() {
        let mut registry = SubscriberRegistry::new();
        registry.register_send(noop("First")).unwrap();
        let err = registry.register_send(noop("Second")).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn publish_registrations_accumulate_in_order() {
        let mut registry = SubscriberRegistry::new();
        registry.register_publish(noop("A")).unwrap();
        registry.register_publish(noop("B")).unwrap();

        let entry = registry.lookup::<Order>().unwrap();
        assert_eq!(entry.mode(), DispatchMode::Publish);
        let names: Vec<_> = entry.handlers().iter().map(|h| h.name()).collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn mixing_send_and_publish_is_rejected() {
        let mut registry = SubscriberRegistry::new();
        registry.register_send(noop("Only")).unwrap();
        let err = registry.register_publish(noop("Extra")).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn lookup_misses_unregistered_types() {
        let registry = SubscriberRegistry::new();
        assert!(registry.lookup::<Order>().is_none());
    }
}
