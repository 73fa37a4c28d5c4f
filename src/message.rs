//! Message model: the on-wire and outbox representation of a request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Unique identifier of a message. Usually the id of the request it wraps,
/// otherwise a random UUID.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&crate::request::RequestId> for MessageId {
    fn from(id: &crate::request::RequestId) -> Self {
        Self(id.as_str().to_string())
    }
}

/// Logical topic or queue name a message routes to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind discriminator carried in every header.
///
/// `None` is the sole legal empty-channel signal; `Quit` is a control
/// sentinel injected to stop a pump. Mappers never produce either.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Command,
    Event,
    Document,
    Quit,
    None,
    Unacceptable,
}

/// CloudEvents attributes carried alongside the native header fields, for
/// brokers and consumers that speak the envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloudEventAttributes {
    pub source: String,
    pub event_type: Option<String>,
    pub spec_version: String,
    pub data_schema: Option<String>,
    pub subject: Option<String>,
}

impl Default for CloudEventAttributes {
    fn default() -> Self {
        Self {
            source: "courier".to_string(),
            event_type: None,
            spec_version: "1.0".to_string(),
            data_schema: None,
            subject: None,
        }
    }
}

/// Message header. Immutable once produced apart from the bag, which
/// pipeline steps may annotate before dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: MessageId,
    pub topic: RoutingKey,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    /// Number of times the message has been requeued. Monotonically
    /// non-decreasing.
    pub handled_count: u32,
    /// Delay requested before the message becomes visible to consumers.
    pub delayed: Duration,
    pub partition_key: Option<String>,
    /// Arbitrary application headers. On brokers with flat header spaces the
    /// whole bag is JSON-encoded into a single attribute.
    pub bag: HashMap<String, serde_json::Value>,
    pub cloud_events: CloudEventAttributes,
}

impl MessageHeader {
    pub fn new(message_id: MessageId, topic: RoutingKey, message_type: MessageType) -> Self {
        Self {
            message_id,
            topic,
            message_type,
            timestamp: Utc::now(),
            correlation_id: None,
            reply_to: None,
            content_type: None,
            handled_count: 0,
            delayed: Duration::ZERO,
            partition_key: None,
            bag: HashMap::new(),
            cloud_events: CloudEventAttributes::default(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_partition_key(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delayed = delay;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.cloud_events.subject = Some(subject.into());
        self
    }

    /// JSON-encode the bag into a single string attribute for brokers that
    /// carry headers out-of-band.
    pub fn bag_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.bag)
    }

    /// Restore the bag from its single-attribute JSON encoding.
    pub fn set_bag_json(&mut self, raw: &str) -> Result<(), serde_json::Error> {
        self.bag = serde_json::from_str(raw)?;
        Ok(())
    }
}

/// Message payload plus its content type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    data: Vec<u8>,
    content_type: String,
}

impl MessageBody {
    pub fn new(data: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self { data, content_type: content_type.into() }
    }

    /// Empty body, used by the control sentinels.
    pub fn none() -> Self {
        Self { data: Vec::new(), content_type: "text/plain".to_string() }
    }

    pub fn json(data: Vec<u8>) -> Self {
        Self { data, content_type: "application/json".to_string() }
    }

    pub fn text(data: impl Into<String>) -> Self {
        Self { data: data.into().into_bytes(), content_type: "text/plain".to_string() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Header and body pair: the unit everything downstream of a mapper moves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// The empty-channel signal. Never put on a wire.
    pub fn none() -> Self {
        Self {
            header: MessageHeader::new(MessageId::random(), RoutingKey::new(""), MessageType::None),
            body: MessageBody::none(),
        }
    }

    /// The pump-stop sentinel. Injected locally, never produced by mappers.
    pub fn quit() -> Self {
        Self {
            header: MessageHeader::new(MessageId::random(), RoutingKey::new(""), MessageType::Quit),
            body: MessageBody::none(),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.header.message_id
    }

    pub fn is_none(&self) -> bool {
        self.header.message_type == MessageType::None
    }

    pub fn is_quit(&self) -> bool {
        self.header.message_type == MessageType::Quit
    }

    /// Copy with the requeue counter bumped, for redelivery.
    pub fn requeued(&self) -> Self {
        let mut msg = self.clone();
        msg.header.handled_count += 1;
        msg
    }
}
