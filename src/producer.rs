//! Broker producers: the outbound half of a broker binding, and the
//! registry that routes messages to them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{ChannelError, DispatchError};
use crate::message::{Message, RoutingKey};

/// What a producer binding can do natively.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProducerCapabilities {
    /// The broker can delay delivery itself; no scheduler fallback needed.
    pub delay_native: bool,
    /// The broker honours partition keys for ordering.
    pub partition_keyed: bool,
}

/// Sends messages to a broker. Implementations wrap a concrete broker
/// client; the core only sees this trait.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    fn capabilities(&self) -> ProducerCapabilities {
        ProducerCapabilities::default()
    }

    /// Send a message, returning the provider's message id when it has one.
    async fn send(&self, message: &Message) -> Result<Option<String>, ChannelError>;

    /// Send with a delivery delay. The default ignores the delay; bindings
    /// with native delay support override this.
    async fn send_with_delay(
        &self,
        message: &Message,
        _delay: Duration,
    ) -> Result<Option<String>, ChannelError> {
        self.send(message).await
    }
}

/// Routing key → producer. Written at startup, read-only afterwards.
#[derive(Default)]
pub struct ProducerRegistry {
    producers: HashMap<RoutingKey, Arc<dyn MessageProducer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: MessageProducer + 'static>(
        &mut self,
        topic: RoutingKey,
        producer: P,
    ) -> &mut Self {
        self.producers.insert(topic, Arc::new(producer));
        self
    }

    /// Resolve the producer for a topic. A miss is a configuration error:
    /// somebody posted to a topic nothing was bound for.
    pub fn lookup(&self, topic: &RoutingKey) -> Result<Arc<dyn MessageProducer>, DispatchError> {
        self.producers.get(topic).cloned().ok_or_else(|| {
            DispatchError::configuration(format!("no producer registered for topic {topic}"))
        })
    }

    /// Registered topics, sorted, for diagnostics.
    pub fn topics(&self) -> Vec<RoutingKey> {
        let mut topics: Vec<RoutingKey> = self.producers.keys().cloned().collect();
        topics.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        topics
    }
}

/// Shared in-process record of everything sent through in-memory producers.
/// The loopback "broker" for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    sent: Arc<Mutex<Vec<Message>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message sent so far, in send order.
    pub fn messages(&self) -> Vec<Message> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Messages sent to one topic, in send order.
    pub fn on_topic(&self, topic: &RoutingKey) -> Vec<Message> {
        self.messages().into_iter().filter(|m| &m.header.topic == topic).collect()
    }

    fn record(&self, message: Message) {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(message);
    }
}

/// Producer that records onto an [`InMemoryBus`].
pub struct InMemoryProducer {
    bus: InMemoryBus,
}

impl InMemoryProducer {
    pub fn new(bus: InMemoryBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    fn capabilities(&self) -> ProducerCapabilities {
        ProducerCapabilities { delay_native: true, partition_keyed: false }
    }

    async fn send(&self, message: &Message) -> Result<Option<String>, ChannelError> {
        tracing::debug!(message_id = %message.id(), topic = %message.header.topic, "bus send");
        self.bus.record(message.clone());
        Ok(Some(message.id().to_string()))
    }
}
