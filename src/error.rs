//! Error taxonomy for dispatch, channels, and stores.

use std::sync::Arc;
use std::time::Duration;

/// Broker-level failure surfaced by channels and producers.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ChannelError {
    /// The producer's circuit breaker is open; the broker was not called.
    #[error("circuit open after {failures} failures (open for {open_for:?})")]
    CircuitOpen {
        /// Consecutive failures observed before the circuit opened.
        failures: usize,
        /// How long the circuit has been open.
        open_for: Duration,
    },
    /// I/O-level broker failure.
    #[error("broker failure: {0}")]
    Io(String),
    /// The channel is closed and will produce no further messages.
    #[error("channel closed")]
    Closed,
}

impl ChannelError {
    /// Whether this failure is an open circuit (back off rather than retry).
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ChannelError::CircuitOpen { .. })
    }
}

/// Failure in an outbox or inbox backend.
#[derive(thiserror::Error, Debug, Clone)]
pub enum StoreError {
    /// The backing store could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The enclosing transaction was aborted; staged writes were discarded.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
}

/// Handler-signalled request to requeue the message being processed.
///
/// Not a failure: pumps translate this into a requeue (or a reject once the
/// requeue limit is reached).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferMessage {
    /// Delay before redelivery; `None` uses the pump's configured delay.
    pub delay: Option<Duration>,
}

impl DeferMessage {
    /// Defer with the pump's default redelivery delay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer with an explicit redelivery delay.
    pub fn after(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

/// Unified error type for dispatch operations.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    /// Missing or inconsistent registration (mapper, handler, producer,
    /// multiplicity). Fatal to the operation; pumps reject and stop.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A message could not be wrapped or unwrapped.
    #[error("failed to map {type_name}: {reason}")]
    MappingFailed {
        /// The request type being mapped.
        type_name: &'static str,
        /// What went wrong.
        reason: String,
    },
    /// A handler asked for the current message to be requeued.
    #[error("handler deferred the message")]
    Defer(DeferMessage),
    /// Broker-level failure, possibly an open circuit.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// A request was seen before and the inbox is configured to throw.
    #[error("request {request_id} already handled under context {context_key}")]
    OnceOnly {
        /// The duplicated request id.
        request_id: String,
        /// The inbox context key the duplicate was found under.
        context_key: String,
    },
    /// One or more fan-out pipelines failed during a publish.
    #[error("{} publish pipeline(s) failed", .0.len())]
    Aggregate(Vec<DispatchError>),
    /// A required read found nothing.
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing record.
        what: String,
    },
    /// Outbox or inbox backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Failure raised by user handler code.
    #[error("handler failure: {source}")]
    App {
        /// The underlying error, source chain intact.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
}

impl DispatchError {
    /// Wrap a user error.
    pub fn app<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DispatchError::App { source: Arc::new(err) }
    }

    /// Shorthand for a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        DispatchError::Configuration(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, DispatchError::Configuration(_))
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self, DispatchError::MappingFailed { .. })
    }

    pub fn is_defer(&self) -> bool {
        matches!(self, DispatchError::Defer(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, DispatchError::Channel(e) if e.is_circuit_open())
    }

    /// Borrow the defer directive, if that is what this error carries.
    pub fn as_defer(&self) -> Option<&DeferMessage> {
        match self {
            DispatchError::Defer(d) => Some(d),
            _ => None,
        }
    }

    /// Inner errors of an aggregate, or a one-element slice for plain errors.
    pub fn inner_errors(&self) -> &[DispatchError] {
        match self {
            DispatchError::Aggregate(inner) => inner.as_slice(),
            _ => std::slice::from_ref(self),
        }
    }
}
