//! Message pumps: long-running consumers that drain a channel into the
//! dispatcher with acknowledge / reject / requeue semantics.

mod reactor;

pub use reactor::{Reactor, ReactorHandle};

use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::error::{ChannelError, DeferMessage, DispatchError};
use crate::mapper::UnwrapPipeline;
use crate::message::{Message, MessageType};
use crate::processor::CommandProcessor;
use crate::request::{Request, RequestContext};

/// Pump tuning. Defaults are deliberately conservative; production pumps
/// override per channel.
#[derive(Clone, Copy, Debug)]
pub struct PumpConfig {
    /// How long one receive waits before yielding the empty signal.
    pub receive_timeout: Duration,
    /// Sleep after an empty receive.
    pub empty_channel_delay: Duration,
    /// Sleep after a broker failure or open circuit on receive.
    pub channel_failure_delay: Duration,
    /// Deliveries before a deferred message is rejected instead of
    /// requeued. Zero requeues forever.
    pub requeue_limit: usize,
    /// Default redelivery delay when a defer does not carry its own.
    pub requeue_delay: Option<Duration>,
    /// Unacceptable messages tolerated before the pump stops. Zero never
    /// stops.
    pub unacceptable_limit: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(1),
            empty_channel_delay: Duration::from_millis(500),
            channel_failure_delay: Duration::from_secs(1),
            requeue_limit: 0,
            requeue_delay: None,
            unacceptable_limit: 0,
        }
    }
}

enum FailureAction {
    Fatal,
    Defer(DeferMessage),
    Unacceptable,
    Discard,
}

/// Drives one channel: receive, unwrap, dispatch, acknowledge, strictly in
/// order. Run it as a task for cooperative pumps, or hand it to
/// [`Reactor::spawn`] for a dedicated blocking thread.
pub struct MessagePump<R: Request + Clone> {
    processor: CommandProcessor,
    unwrap: Arc<UnwrapPipeline<R>>,
    config: PumpConfig,
}

impl<R: Request + Clone> MessagePump<R> {
    /// Build a pump for `R`'s channel. Fails fast when no mapper is
    /// registered for `R`.
    pub fn new(processor: CommandProcessor, config: PumpConfig) -> Result<Self, DispatchError> {
        let unwrap = processor.mappers().unwrap_pipeline::<R>()?;
        Ok(Self { processor, unwrap, config })
    }

    /// Consume the channel until a quit sentinel, the unacceptable-message
    /// limit, a dead channel, or a fatal configuration error.
    pub async fn run(self, mut channel: Box<dyn Channel>) -> Result<(), DispatchError> {
        let topic = channel.topic().clone();
        tracing::info!(topic = %topic, "message pump started");
        let mut unacceptable_count: usize = 0;

        let result = loop {
            if self.config.unacceptable_limit > 0
                && unacceptable_count >= self.config.unacceptable_limit
            {
                tracing::error!(
                    topic = %topic,
                    count = unacceptable_count,
                    "unacceptable message limit reached, stopping"
                );
                channel.stop().await;
                break Ok(());
            }

            let message = match channel.receive(self.config.receive_timeout).await {
                Ok(message) => message,
                Err(e) if e.is_circuit_open() => {
                    tracing::debug!(topic = %topic, "receive circuit open, backing off");
                    tokio::time::sleep(self.config.channel_failure_delay).await;
                    continue;
                }
                Err(ChannelError::Closed) => {
                    tracing::error!(topic = %topic, "channel closed under the pump");
                    channel.stop().await;
                    break Err(DispatchError::Channel(ChannelError::Closed));
                }
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "receive failed, backing off");
                    tokio::time::sleep(self.config.channel_failure_delay).await;
                    continue;
                }
            };

            match message.header.message_type {
                MessageType::None => {
                    tokio::time::sleep(self.config.empty_channel_delay).await;
                    continue;
                }
                MessageType::Unacceptable => {
                    unacceptable_count += 1;
                    tracing::warn!(
                        topic = %topic,
                        message_id = %message.id(),
                        count = unacceptable_count,
                        "unacceptable message"
                    );
                    Self::ack(&mut channel, &message).await;
                    continue;
                }
                MessageType::Quit => {
                    tracing::info!(topic = %topic, "quit sentinel received");
                    channel.stop().await;
                    break Ok(());
                }
                MessageType::Command | MessageType::Event | MessageType::Document => {
                    match self.process(&message).await {
                        Ok(()) => Self::ack(&mut channel, &message).await,
                        Err(e) => match Self::classify(&e) {
                            FailureAction::Fatal => {
                                tracing::error!(
                                    topic = %topic,
                                    message_id = %message.id(),
                                    error = %e,
                                    "configuration failure, stopping pump"
                                );
                                if let Err(reject_err) = channel.reject(&message).await {
                                    tracing::warn!(error = %reject_err, "reject failed");
                                }
                                channel.stop().await;
                                break Err(e);
                            }
                            FailureAction::Defer(defer) => {
                                self.requeue_or_reject(&mut channel, &message, defer).await;
                            }
                            FailureAction::Unacceptable => {
                                unacceptable_count += 1;
                                tracing::warn!(
                                    topic = %topic,
                                    message_id = %message.id(),
                                    error = %e,
                                    count = unacceptable_count,
                                    "message failed to unwrap"
                                );
                                Self::ack(&mut channel, &message).await;
                            }
                            FailureAction::Discard => {
                                tracing::warn!(
                                    topic = %topic,
                                    message_id = %message.id(),
                                    error = %e,
                                    "handler failed, acknowledging"
                                );
                                Self::ack(&mut channel, &message).await;
                            }
                        },
                    }
                }
            }
        };

        tracing::info!(topic = %topic, "message pump stopped");
        result
    }

    async fn process(&self, message: &Message) -> Result<(), DispatchError> {
        let ctx = RequestContext::from_message(&message.header);
        let request = self.unwrap.unwrap(message, &ctx).await?;
        match message.header.message_type {
            MessageType::Command => self.processor.send_with_context(request, &ctx).await,
            MessageType::Event | MessageType::Document => {
                self.processor.publish_with_context(request, &ctx).await
            }
            _ => Ok(()),
        }
    }

    /// Map a dispatch failure to a pump action, looking through aggregates:
    /// any configuration failure is fatal, otherwise a defer wins, then
    /// mapping failures count as unacceptable, and anything else is logged
    /// and dropped.
    fn classify(error: &DispatchError) -> FailureAction {
        let inners = error.inner_errors();
        if inners.iter().any(DispatchError::is_configuration) {
            return FailureAction::Fatal;
        }
        if let Some(defer) = inners.iter().find_map(DispatchError::as_defer) {
            return FailureAction::Defer(defer.clone());
        }
        if inners.iter().any(DispatchError::is_mapping) {
            return FailureAction::Unacceptable;
        }
        FailureAction::Discard
    }

    async fn requeue_or_reject(
        &self,
        channel: &mut Box<dyn Channel>,
        message: &Message,
        defer: DeferMessage,
    ) {
        let deliveries = message.header.handled_count as usize + 1;
        if self.config.requeue_limit > 0 && deliveries >= self.config.requeue_limit {
            tracing::warn!(
                message_id = %message.id(),
                handled_count = message.header.handled_count,
                "requeue limit reached, rejecting"
            );
            if let Err(e) = channel.reject(message).await {
                tracing::warn!(error = %e, "reject failed");
            }
            return;
        }

        let delay = defer.delay.or(self.config.requeue_delay);
        tracing::debug!(
            message_id = %message.id(),
            handled_count = message.header.handled_count,
            delay = ?delay,
            "requeueing deferred message"
        );
        match channel.requeue(message.requeued(), delay).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(message_id = %message.id(), "requeue dropped the message"),
            Err(e) => tracing::warn!(message_id = %message.id(), error = %e, "requeue failed"),
        }
    }

    async fn ack(channel: &mut Box<dyn Channel>, message: &Message) {
        if let Err(e) = channel.acknowledge(message).await {
            tracing::warn!(message_id = %message.id(), error = %e, "acknowledge failed");
        }
    }
}
