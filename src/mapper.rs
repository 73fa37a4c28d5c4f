//! Request ↔ message translation: mappers, transforms, and the cached
//! wrap/unwrap pipelines built from them.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::message::{Message, MessageBody, MessageHeader, MessageId, MessageType, RoutingKey};
use crate::request::{Request, RequestContext, RequestKind};

/// Converts a request to a message and back. The mapper is the boundary
/// between the typed request world and the byte-oriented message world.
pub trait MessageMapper<R: Request>: Send + Sync {
    fn map_to_message(
        &self,
        request: &R,
        ctx: &RequestContext,
    ) -> Result<Message, DispatchError>;

    fn map_to_request(
        &self,
        message: &Message,
        ctx: &RequestContext,
    ) -> Result<R, DispatchError>;
}

/// A message-level step around the mapper: compression, claim checks,
/// header stamping. `wrap` runs on the publish side, `unwrap` undoes it on
/// the consume side.
#[async_trait]
pub trait MessageTransform: Send + Sync {
    async fn wrap(
        &self,
        message: Message,
        ctx: &RequestContext,
    ) -> Result<Message, DispatchError>;

    async fn unwrap(
        &self,
        message: Message,
        ctx: &RequestContext,
    ) -> Result<Message, DispatchError>;
}

type TransformFactory =
    Arc<dyn Fn() -> Result<Arc<dyn MessageTransform>, DispatchError> + Send + Sync>;

/// Declares one transform on a mapper registration: an ordering step plus a
/// factory producing the transform instance.
#[derive(Clone)]
pub struct TransformDescriptor {
    name: &'static str,
    step: i32,
    factory: TransformFactory,
}

impl TransformDescriptor {
    pub fn new<T, F>(name: &'static str, step: i32, factory: F) -> Self
    where
        T: MessageTransform + 'static,
        F: Fn() -> Result<Arc<T>, DispatchError> + Send + Sync + 'static,
    {
        let factory: TransformFactory = Arc::new(move || {
            factory().map(|transform| {
                let transform: Arc<dyn MessageTransform> = transform;
                transform
            })
        });
        Self { name, step, factory }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

struct MapperRegistration<R: Request> {
    mapper: Arc<dyn MessageMapper<R>>,
    transforms: Vec<TransformDescriptor>,
}

/// Applies the mapper, then the transforms in ascending step order.
pub struct WrapPipeline<R: Request> {
    mapper: Arc<dyn MessageMapper<R>>,
    transforms: Vec<Arc<dyn MessageTransform>>,
}

impl<R: Request> std::fmt::Debug for WrapPipeline<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrapPipeline<{}>{{transforms:{}}}", type_name::<R>(), self.transforms.len())
    }
}

impl<R: Request> WrapPipeline<R> {
    pub async fn wrap(
        &self,
        request: &R,
        ctx: &RequestContext,
    ) -> Result<Message, DispatchError> {
        let mut message = self.mapper.map_to_message(request, ctx)?;
        for transform in &self.transforms {
            message = transform.wrap(message, ctx).await?;
        }
        Ok(message)
    }
}

/// Undoes the transforms in descending step order, then applies the mapper.
pub struct UnwrapPipeline<R: Request> {
    mapper: Arc<dyn MessageMapper<R>>,
    transforms: Vec<Arc<dyn MessageTransform>>,
}

impl<R: Request> std::fmt::Debug for UnwrapPipeline<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnwrapPipeline<{}>{{transforms:{}}}", type_name::<R>(), self.transforms.len())
    }
}

impl<R: Request> UnwrapPipeline<R> {
    pub async fn unwrap(
        &self,
        message: &Message,
        ctx: &RequestContext,
    ) -> Result<R, DispatchError> {
        let mut message = message.clone();
        for transform in self.transforms.iter().rev() {
            message = transform.unwrap(message, ctx).await?;
        }
        self.mapper.map_to_request(&message, ctx)
    }
}

type PipelineCache = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Registry of mappers and their transforms, with lazily built, shared
/// pipeline instances per request type and direction.
///
/// Registration happens at startup through `&mut`; lookups afterwards are
/// lock-free reads of a copy-on-write cache.
#[derive(Default)]
pub struct MapperRegistry {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    wrap_cache: ArcSwap<PipelineCache>,
    unwrap_cache: ArcSwap<PipelineCache>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapper without transforms.
    pub fn register<R, M>(&mut self, mapper: M) -> &mut Self
    where
        R: Request,
        M: MessageMapper<R> + 'static,
    {
        self.register_with_transforms(mapper, Vec::new())
    }

    /// Register a mapper together with its transform declarations.
    pub fn register_with_transforms<R, M>(
        &mut self,
        mapper: M,
        transforms: Vec<TransformDescriptor>,
    ) -> &mut Self
    where
        R: Request,
        M: MessageMapper<R> + 'static,
    {
        self.entries.insert(
            TypeId::of::<R>(),
            Box::new(MapperRegistration::<R> { mapper: Arc::new(mapper), transforms }),
        );
        self
    }

    fn registration<R: Request>(&self) -> Result<&MapperRegistration<R>, DispatchError> {
        self.entries
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.downcast_ref::<MapperRegistration<R>>())
            .ok_or_else(|| {
                DispatchError::configuration(format!(
                    "no message mapper registered for {}",
                    type_name::<R>()
                ))
            })
    }

    fn instantiate(
        transforms: &[TransformDescriptor],
    ) -> Result<Vec<Arc<dyn MessageTransform>>, DispatchError> {
        let mut ordered: Vec<&TransformDescriptor> = transforms.iter().collect();
        // Stable sort keeps declaration order for equal steps.
        ordered.sort_by_key(|descriptor| descriptor.step);
        ordered
            .into_iter()
            .map(|descriptor| {
                (descriptor.factory)().map_err(|e| {
                    DispatchError::configuration(format!(
                        "transform {} factory failed: {e}",
                        descriptor.name
                    ))
                })
            })
            .collect()
    }

    /// The shared wrap pipeline for `R`, building and caching it on first
    /// use.
    pub fn wrap_pipeline<R: Request>(&self) -> Result<Arc<WrapPipeline<R>>, DispatchError> {
        let key = TypeId::of::<R>();
        if let Some(cached) = self.wrap_cache.load().get(&key) {
            if let Ok(pipeline) = cached.clone().downcast::<WrapPipeline<R>>() {
                return Ok(pipeline);
            }
        }

        let registration = self.registration::<R>()?;
        let pipeline = Arc::new(WrapPipeline {
            mapper: registration.mapper.clone(),
            transforms: Self::instantiate(&registration.transforms)?,
        });
        let entry: Arc<dyn Any + Send + Sync> = pipeline.clone();
        self.wrap_cache.rcu(|cache| {
            let mut next = PipelineCache::clone(cache);
            next.insert(key, entry.clone());
            next
        });
        Ok(pipeline)
    }

    /// The shared unwrap pipeline for `R`, building and caching it on first
    /// use.
    pub fn unwrap_pipeline<R: Request>(&self) -> Result<Arc<UnwrapPipeline<R>>, DispatchError> {
        let key = TypeId::of::<R>();
        if let Some(cached) = self.unwrap_cache.load().get(&key) {
            if let Ok(pipeline) = cached.clone().downcast::<UnwrapPipeline<R>>() {
                return Ok(pipeline);
            }
        }

        let registration = self.registration::<R>()?;
        let pipeline = Arc::new(UnwrapPipeline {
            mapper: registration.mapper.clone(),
            transforms: Self::instantiate(&registration.transforms)?,
        });
        let entry: Arc<dyn Any + Send + Sync> = pipeline.clone();
        self.unwrap_cache.rcu(|cache| {
            let mut next = PipelineCache::clone(cache);
            next.insert(key, entry.clone());
            next
        });
        Ok(pipeline)
    }

    /// Drop every cached pipeline. Registrations survive; the next lookup
    /// rebuilds.
    pub fn clear_pipeline_cache(&self) {
        self.wrap_cache.store(Arc::new(PipelineCache::new()));
        self.unwrap_cache.store(Arc::new(PipelineCache::new()));
    }
}

/// Serde-backed mapper: the request serializes to a JSON body, identity and
/// correlation copy into the header, and the type's kind picks the message
/// type.
pub struct JsonMessageMapper<R> {
    topic: RoutingKey,
    _marker: PhantomData<fn() -> R>,
}

impl<R> JsonMessageMapper<R> {
    pub fn new(topic: RoutingKey) -> Self {
        Self { topic, _marker: PhantomData }
    }
}

impl<R> MessageMapper<R> for JsonMessageMapper<R>
where
    R: Request + Serialize + DeserializeOwned,
{
    fn map_to_message(
        &self,
        request: &R,
        ctx: &RequestContext,
    ) -> Result<Message, DispatchError> {
        let data = serde_json::to_vec(request).map_err(|e| DispatchError::MappingFailed {
            type_name: type_name::<R>(),
            reason: e.to_string(),
        })?;

        let message_type = match request.kind() {
            RequestKind::Command => MessageType::Command,
            RequestKind::Event => MessageType::Event,
            RequestKind::Document => MessageType::Document,
        };

        let mut header =
            MessageHeader::new(MessageId::from(request.id()), self.topic.clone(), message_type)
                .with_content_type("application/json");
        header.correlation_id = request
            .correlation_id()
            .map(str::to_string)
            .or_else(|| ctx.correlation_id().map(str::to_string));
        header.partition_key = request.partition_key().map(str::to_string);
        header.cloud_events.event_type = Some(type_name::<R>().to_string());

        Ok(Message::new(header, MessageBody::json(data)))
    }

    fn map_to_request(
        &self,
        message: &Message,
        _ctx: &RequestContext,
    ) -> Result<R, DispatchError> {
        serde_json::from_slice(message.body.bytes()).map_err(|e| DispatchError::MappingFailed {
            type_name: type_name::<R>(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestId;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        id: RequestId,
        note: String,
    }

    impl Request for Ping {
        fn id(&self) -> &RequestId {
            &self.id
        }

        fn kind(&self) -> RequestKind {
            RequestKind::Event
        }
    }

    struct Stamp {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MessageTransform for Stamp {
        async fn wrap(
            &self,
            mut message: Message,
            _ctx: &RequestContext,
        ) -> Result<Message, DispatchError> {
            self.log.lock().unwrap().push(format!("wrap:{}", self.label));
            message.header.bag.insert(self.label.to_string(), serde_json::json!(true));
            Ok(message)
        }

        async fn unwrap(
            &self,
            message: Message,
            _ctx: &RequestContext,
        ) -> Result<Message, DispatchError> {
            self.log.lock().unwrap().push(format!("unwrap:{}", self.label));
            Ok(message)
        }
    }

    fn stamped_registry(log: &Arc<Mutex<Vec<String>>>) -> MapperRegistry {
        let mut registry = MapperRegistry::new();
        let outer = log.clone();
        let inner = log.clone();
        registry.register_with_transforms::<Ping, _>(
            JsonMessageMapper::new(RoutingKey::new("pings")),
            vec![
                // Declared out of step order on purpose.
                TransformDescriptor::new("outer", 2, move || {
                    Ok(Arc::new(Stamp { label: "outer", log: outer.clone() }))
                }),
                TransformDescriptor::new("inner", 1, move || {
                    Ok(Arc::new(Stamp { label: "inner", log: inner.clone() }))
                }),
            ],
        );
        registry
    }

    fn ping() -> Ping {
        Ping { id: RequestId::new("p-1"), note: "hi".into() }
    }

    #[tokio::test]
    async fn json_mapper_round_trips() {
        let mut registry = MapperRegistry::new();
        registry.register::<Ping, _>(JsonMessageMapper::new(RoutingKey::new("pings")));
        let ctx = RequestContext::new();

        let message = registry.wrap_pipeline::<Ping>().unwrap().wrap(&ping(), &ctx).await.unwrap();
        assert_eq!(message.id().as_str(), "p-1");
        assert_eq!(message.header.topic.as_str(), "pings");
        assert_eq!(message.header.message_type, MessageType::Event);

        let back: Ping =
            registry.unwrap_pipeline::<Ping>().unwrap().unwrap(&message, &ctx).await.unwrap();
        assert_eq!(back, ping());
    }

    #[tokio::test]
    async fn transforms_run_in_step_order_and_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = stamped_registry(&log);
        let ctx = RequestContext::new();

        let message = registry.wrap_pipeline::<Ping>().unwrap().wrap(&ping(), &ctx).await.unwrap();
        assert!(message.header.bag.contains_key("inner"));
        assert!(message.header.bag.contains_key("outer"));

        let _: Ping =
            registry.unwrap_pipeline::<Ping>().unwrap().unwrap(&message, &ctx).await.unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["wrap:inner", "wrap:outer", "unwrap:outer", "unwrap:inner"]
        );
    }

    #[test]
    fn missing_mapper_is_a_configuration_error() {
        let registry = MapperRegistry::new();
        let err = registry.wrap_pipeline::<Ping>().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn pipelines_are_cached_until_cleared() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = stamped_registry(&log);

        let first = registry.wrap_pipeline::<Ping>().unwrap();
        let second = registry.wrap_pipeline::<Ping>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.clear_pipeline_cache();
        let rebuilt = registry.wrap_pipeline::<Ping>().unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
    }

    #[test]
    fn failing_transform_factory_is_a_configuration_error() {
        let mut registry = MapperRegistry::new();
        registry.register_with_transforms::<Ping, _>(
            JsonMessageMapper::new(RoutingKey::new("pings")),
            vec![TransformDescriptor::new("broken", 1, || -> Result<Arc<Stamp>, DispatchError> {
                Err(DispatchError::configuration("factory exploded"))
            })],
        );
        let err = registry.wrap_pipeline::<Ping>().unwrap_err();
        assert!(err.is_configuration());
    }
}
