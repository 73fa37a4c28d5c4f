//! Request model: the things applications ask the dispatcher to route.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::message::MessageHeader;

/// Unique identifier of a logical request. Assigned at construction and
/// never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an application-chosen id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a request is, which decides how it dispatches: commands expect
/// exactly one handler, events and documents fan out to zero or more.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Command,
    Event,
    Document,
}

/// A routable request: a command, an event, or a document.
pub trait Request: Send + Sync + 'static {
    /// The request's identity.
    fn id(&self) -> &RequestId;

    /// Command, event, or document.
    fn kind(&self) -> RequestKind;

    /// Correlation id carried across the causal chain, if any.
    fn correlation_id(&self) -> Option<&str> {
        None
    }

    /// Broker ordering key, if the request needs one.
    fn partition_key(&self) -> Option<&str> {
        None
    }
}

/// Ambient state shared down a handler pipeline.
///
/// Cheap to clone: the bag is shared, so middleware mutations are visible to
/// later links and to the caller.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    correlation_id: Option<String>,
    origin: Option<MessageHeader>,
    bag: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a request arriving off a channel, keeping the originating
    /// header for reply and correlation purposes.
    pub fn from_message(header: &MessageHeader) -> Self {
        Self {
            correlation_id: header.correlation_id.clone(),
            origin: Some(header.clone()),
            bag: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The header of the message this request was unwrapped from, when the
    /// request came off a channel.
    pub fn origin(&self) -> Option<&MessageHeader> {
        self.origin.as_ref()
    }

    /// Store a value in the shared bag.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.bag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.into(), value);
    }

    /// Read a value from the shared bag.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.bag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }
}
