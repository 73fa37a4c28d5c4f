//! Outbox: durable staging for outbound messages, committed with business
//! state and dispatched by the mediator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::StoreError;
use crate::message::{Message, MessageId};

/// Lifecycle of an outbox entry. Entries are created `Outstanding` and move
/// to `Dispatched` exactly once, after a producer accepted the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboxState {
    Outstanding,
    Dispatched,
}

/// One staged message and its dispatch bookkeeping.
#[derive(Clone, Debug)]
pub struct OutboxEntry {
    pub message: Message,
    pub state: OutboxState,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Producer send attempts, kept for operator visibility into poison
    /// messages.
    pub attempts: u32,
    pub context_key: Option<String>,
}

/// A unit of work the outbox can stage writes into. Backends downcast to
/// their own transaction type; dropping without commit discards the writes.
#[async_trait]
pub trait OutboxTransaction: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Capability of starting transactions for a given outbox backend.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, StoreError>;
}

/// Durable store of outbound messages keyed by message id.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Stage a message as `Outstanding`. With a transaction, the write only
    /// becomes visible on commit; without one the store must guarantee
    /// single-row atomicity.
    async fn add(
        &self,
        message: Message,
        context_key: Option<&str>,
        txn: Option<&mut dyn OutboxTransaction>,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: &MessageId) -> Result<Option<OutboxEntry>, StoreError>;

    /// Outstanding messages at least `older_than` old, oldest first, capped
    /// at `limit`.
    async fn outstanding(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Conditionally move an entry from `Outstanding` to `Dispatched`.
    /// Returns false when the entry was missing or already dispatched; the
    /// transition happens at most once.
    async fn mark_dispatched(
        &self,
        id: &MessageId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Bump the attempt counter for an entry.
    async fn record_attempt(&self, id: &MessageId) -> Result<(), StoreError>;
}

type SharedEntries = Arc<Mutex<HashMap<MessageId, OutboxEntry>>>;

/// In-memory outbox for tests and single-process deployments. Plain adds
/// are single-row atomic; transactional adds stage into an
/// [`InMemoryTransaction`].
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    entries: SharedEntries,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that stages writes against this outbox.
    pub fn transaction_provider(&self) -> InMemoryTransactionProvider {
        InMemoryTransactionProvider { entries: self.entries.clone() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, OutboxEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry(message: Message, context_key: Option<&str>) -> OutboxEntry {
        OutboxEntry {
            message,
            state: OutboxState::Outstanding,
            created_at: Utc::now(),
            dispatched_at: None,
            attempts: 0,
            context_key: context_key.map(str::to_string),
        }
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn add(
        &self,
        message: Message,
        context_key: Option<&str>,
        txn: Option<&mut dyn OutboxTransaction>,
    ) -> Result<(), StoreError> {
        let entry = Self::entry(message, context_key);
        match txn {
            None => {
                self.lock().insert(entry.message.id().clone(), entry);
                Ok(())
            }
            Some(txn) => {
                let txn = txn
                    .as_any_mut()
                    .downcast_mut::<InMemoryTransaction>()
                    .ok_or_else(|| {
                        StoreError::Unavailable(
                            "transaction does not belong to this outbox".into(),
                        )
                    })?;
                txn.staged.push(entry);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &MessageId) -> Result<Option<OutboxEntry>, StoreError> {
        Ok(self.lock().get(id).cloned())
    }

    async fn outstanding(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let mut aged: Vec<OutboxEntry> = self
            .lock()
            .values()
            .filter(|e| e.state == OutboxState::Outstanding && e.created_at <= cutoff)
            .cloned()
            .collect();
        aged.sort_by_key(|e| e.created_at);
        Ok(aged.into_iter().take(limit).map(|e| e.message).collect())
    }

    async fn mark_dispatched(
        &self,
        id: &MessageId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(entry) if entry.state == OutboxState::Outstanding => {
                entry.state = OutboxState::Dispatched;
                entry.dispatched_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_attempt(&self, id: &MessageId) -> Result<(), StoreError> {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.attempts += 1;
        }
        Ok(())
    }
}

/// Staged writes against an [`InMemoryOutbox`]; visible only after commit.
pub struct InMemoryTransaction {
    entries: SharedEntries,
    staged: Vec<OutboxEntry>,
}

#[async_trait]
impl OutboxTransaction for InMemoryTransaction {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in self.staged {
            entries.insert(entry.message.id().clone(), entry);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Starts [`InMemoryTransaction`]s for one outbox.
pub struct InMemoryTransactionProvider {
    entries: SharedEntries,
}

#[async_trait]
impl TransactionProvider for InMemoryTransactionProvider {
    async fn begin(&self) -> Result<Box<dyn OutboxTransaction>, StoreError> {
        Ok(Box::new(InMemoryTransaction { entries: self.entries.clone(), staged: Vec::new() }))
    }
}
