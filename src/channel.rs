//! Channels: the bounded conduit between a broker consumer and a pump.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::message::{Message, RoutingKey};

/// The inbound half of a broker binding. A pump owns its channel
/// exclusively; `receive → acknowledge/reject/requeue` is the whole
/// protocol.
#[async_trait]
pub trait Channel: Send {
    /// The topic this channel consumes.
    fn topic(&self) -> &RoutingKey;

    /// Next message, or a `MessageType::None` message when the channel is
    /// empty at the timeout.
    async fn receive(&mut self, timeout: Duration) -> Result<Message, ChannelError>;

    /// Confirm a message so the broker stops redelivering it.
    async fn acknowledge(&mut self, message: &Message) -> Result<(), ChannelError>;

    /// Refuse a message; the broker drops or dead-letters it.
    async fn reject(&mut self, message: &Message) -> Result<(), ChannelError>;

    /// Put a message back for redelivery, optionally after a delay. Returns
    /// false when the message could not be requeued and was dropped.
    async fn requeue(
        &mut self,
        message: Message,
        delay: Option<Duration>,
    ) -> Result<bool, ChannelError>;

    /// Inject a message locally, bypassing the broker. Used to deliver the
    /// quit sentinel and for tests.
    async fn enqueue_local(&mut self, message: Message) -> Result<(), ChannelError>;

    /// Release the channel. Receives after this fail with `Closed`.
    async fn stop(&mut self);
}

/// Counters shared with tests and operators: what the channel acked,
/// rejected, and requeued.
#[derive(Clone, Debug, Default)]
pub struct ChannelStats {
    acknowledged: Arc<AtomicUsize>,
    rejected: Arc<AtomicUsize>,
    requeued: Arc<AtomicUsize>,
}

impl ChannelStats {
    pub fn acknowledged(&self) -> usize {
        self.acknowledged.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> usize {
        self.requeued.load(Ordering::SeqCst)
    }
}

/// Handle for feeding an [`InMemoryChannel`] from outside the pump.
#[derive(Clone)]
pub struct InMemorySender {
    tx: mpsc::Sender<Message>,
}

impl InMemorySender {
    /// Deliver a message to the channel.
    pub async fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.tx.send(message).await.map_err(|_| ChannelError::Closed)
    }

    /// Deliver the quit sentinel, stopping the pump that owns the channel.
    pub async fn quit(&self) -> Result<(), ChannelError> {
        self.send(Message::quit()).await
    }
}

/// Bounded in-process channel over a tokio mpsc queue. The broker stand-in
/// for tests and loopback topologies; requeue delays are honoured with a
/// timer task.
pub struct InMemoryChannel {
    topic: RoutingKey,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    stats: ChannelStats,
    stopped: bool,
}

impl InMemoryChannel {
    /// A channel holding at most `capacity` undelivered messages.
    pub fn new(topic: RoutingKey, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { topic, tx, rx, stats: ChannelStats::default(), stopped: false }
    }

    /// A sender handle; grab one before handing the channel to a pump.
    pub fn sender(&self) -> InMemorySender {
        InMemorySender { tx: self.tx.clone() }
    }

    /// Shared counters; clone before handing the channel to a pump.
    pub fn stats(&self) -> ChannelStats {
        self.stats.clone()
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn topic(&self) -> &RoutingKey {
        &self.topic
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Message, ChannelError> {
        if self.stopped {
            return Err(ChannelError::Closed);
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ChannelError::Closed),
            Err(_) => Ok(Message::none()),
        }
    }

    async fn acknowledge(&mut self, message: &Message) -> Result<(), ChannelError> {
        tracing::trace!(message_id = %message.id(), "ack");
        self.stats.acknowledged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&mut self, message: &Message) -> Result<(), ChannelError> {
        tracing::debug!(message_id = %message.id(), "reject");
        self.stats.rejected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn requeue(
        &mut self,
        message: Message,
        delay: Option<Duration>,
    ) -> Result<bool, ChannelError> {
        self.stats.requeued.fetch_add(1, Ordering::SeqCst);
        match delay.filter(|d| !d.is_zero()) {
            None => self.tx.send(message).await.map_err(|_| ChannelError::Closed)?,
            Some(delay) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(message).await.is_err() {
                        tracing::debug!("delayed requeue raced channel close");
                    }
                });
            }
        }
        Ok(true)
    }

    async fn enqueue_local(&mut self, message: Message) -> Result<(), ChannelError> {
        self.tx.send(message).await.map_err(|_| ChannelError::Closed)
    }

    async fn stop(&mut self) {
        self.stopped = true;
        self.rx.close();
    }
}
