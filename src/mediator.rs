//! Outbox-producer mediator: stages messages with business state, then
//! pushes them through producers under retry and circuit-breaker policies.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::DispatchError;
use crate::message::{Message, MessageId};
use crate::outbox::{Outbox, OutboxState, OutboxTransaction};
use crate::policy::{PolicyError, PolicyRegistry, CIRCUIT_BREAKER, RETRY_POLICY};
use crate::producer::ProducerRegistry;

/// Coordinates the outbox and the producers. Owns no registries; it borrows
/// shared handles from the processor that built it.
pub struct OutboxMediator {
    outbox: Arc<dyn Outbox>,
    producers: Arc<ProducerRegistry>,
    policies: Arc<PolicyRegistry>,
}

impl OutboxMediator {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        producers: Arc<ProducerRegistry>,
        policies: Arc<PolicyRegistry>,
    ) -> Self {
        Self { outbox, producers, policies }
    }

    /// Stage messages as `Outstanding`, under the caller's transaction when
    /// one is supplied. Returns the staged ids in order.
    pub async fn deposit(
        &self,
        messages: Vec<Message>,
        context_key: Option<&str>,
        txn: Option<&mut dyn OutboxTransaction>,
    ) -> Result<Vec<MessageId>, DispatchError> {
        let mut ids = Vec::with_capacity(messages.len());
        match txn {
            Some(t) => {
                for message in messages {
                    let id = message.id().clone();
                    self.outbox.add(message, context_key, Some(&mut *t)).await?;
                    tracing::debug!(message_id = %id, "message deposited");
                    ids.push(id);
                }
            }
            None => {
                for message in messages {
                    let id = message.id().clone();
                    self.outbox.add(message, context_key, None).await?;
                    tracing::debug!(message_id = %id, "message deposited");
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Dispatch the given entries, in order, stopping at the first failure
    /// so later messages never overtake an earlier one that could not go.
    pub async fn clear(&self, ids: &[MessageId]) -> Result<(), DispatchError> {
        for id in ids {
            self.dispatch_one(id).await?;
        }
        Ok(())
    }

    /// Sweep pass: dispatch outstanding entries at least `older_than` old.
    /// Per-entry failures are logged and left for the next sweep. Returns
    /// how many entries were dispatched.
    pub async fn clear_outstanding(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<usize, DispatchError> {
        let aged = self.outbox.outstanding(older_than, limit).await?;
        let mut cleared = 0;
        for message in aged {
            match self.dispatch_one(message.id()).await {
                Ok(true) => cleared += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(message_id = %message.id(), error = %e, "sweep dispatch failed");
                }
            }
        }
        Ok(cleared)
    }

    /// Dispatch one entry. Absent or already-dispatched entries are no-ops.
    /// The producer send runs retried inside the circuit breaker, so one
    /// whole retry run counts as a single call against the circuit.
    async fn dispatch_one(&self, id: &MessageId) -> Result<bool, DispatchError> {
        let entry = match self.outbox.get(id).await? {
            None => {
                tracing::debug!(message_id = %id, "clear skipped: not in outbox");
                return Ok(false);
            }
            Some(entry) => entry,
        };
        if entry.state == OutboxState::Dispatched {
            return Ok(false);
        }

        let producer = self.producers.lookup(&entry.message.header.topic)?;
        let breaker = self.policies.require(CIRCUIT_BREAKER)?;
        let retry = self.policies.require(RETRY_POLICY)?;

        let outbox = self.outbox.clone();
        let message = entry.message.clone();
        let entry_id = id.clone();
        let result = breaker
            .execute(move || {
                let retry = retry.clone();
                let producer = producer.clone();
                let outbox = outbox.clone();
                let message = message.clone();
                let id = entry_id.clone();
                async move {
                    retry
                        .execute(move || {
                            let producer = producer.clone();
                            let outbox = outbox.clone();
                            let message = message.clone();
                            let id = id.clone();
                            async move {
                                outbox
                                    .record_attempt(&id)
                                    .await
                                    .map_err(|e| PolicyError::Inner(e.into()))?;
                                let delay = message.header.delayed;
                                let sent = if !delay.is_zero()
                                    && producer.capabilities().delay_native
                                {
                                    producer.send_with_delay(&message, delay).await
                                } else {
                                    producer.send(&message).await
                                };
                                sent.map_err(|e| PolicyError::Inner(e.into()))
                            }
                        })
                        .await
                }
            })
            .await;

        match result {
            Ok(provider_id) => {
                self.outbox.mark_dispatched(id, Utc::now()).await?;
                tracing::debug!(
                    message_id = %id,
                    provider_id = provider_id.as_deref().unwrap_or(""),
                    "message dispatched"
                );
                Ok(true)
            }
            Err(e) => Err(e.into_dispatch()),
        }
    }
}

/// Sweeper cadence and reach.
#[derive(Clone, Copy, Debug)]
pub struct SweepConfig {
    /// Time between sweep passes.
    pub interval: Duration,
    /// Minimum entry age before the sweeper picks it up, so in-flight
    /// deposits are not raced.
    pub older_than: Duration,
    /// Entries per pass.
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            older_than: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

/// Background task that re-attempts outstanding entries forever until
/// stopped. Entries are never deleted; retention is someone else's policy.
pub struct OutboxSweeper {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl OutboxSweeper {
    pub fn start(mediator: Arc<OutboxMediator>, config: SweepConfig) -> Self {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            tracing::info!(interval = ?config.interval, "outbox sweeper started");
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(config.interval) => {
                        match mediator.clear_outstanding(config.older_than, config.batch_size).await {
                            Ok(0) => {}
                            Ok(cleared) => tracing::debug!(cleared, "sweep dispatched outstanding messages"),
                            Err(e) => tracing::warn!(error = %e, "sweep pass failed"),
                        }
                    }
                }
            }
            tracing::info!("outbox sweeper stopped");
        });
        Self { shutdown, handle }
    }

    /// Signal the sweeper and wait for it to finish its current pass.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
