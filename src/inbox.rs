//! Inbox: durable record of handled request ids for once-only semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::request::RequestId;

/// One recorded request. Keyed by `(request_id, context_key)` so the same
/// request can be tracked independently per consuming context.
#[derive(Clone, Debug)]
pub struct InboxEntry {
    pub request_id: RequestId,
    pub context_key: String,
    pub body: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Durable store of inbound request ids. Duplicate adds are no-ops, never
/// errors; deciding what a duplicate means is the caller's policy.
#[async_trait]
pub trait Inbox: Send + Sync {
    async fn add(
        &self,
        request_id: &RequestId,
        context_key: &str,
        body: &[u8],
    ) -> Result<(), StoreError>;

    async fn exists(&self, request_id: &RequestId, context_key: &str)
        -> Result<bool, StoreError>;

    async fn get(
        &self,
        request_id: &RequestId,
        context_key: &str,
    ) -> Result<Option<InboxEntry>, StoreError>;
}

/// In-memory inbox for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryInbox {
    entries: Arc<Mutex<HashMap<(String, String), InboxEntry>>>,
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(request_id: &RequestId, context_key: &str) -> (String, String) {
        (request_id.as_str().to_string(), context_key.to_string())
    }
}

#[async_trait]
impl Inbox for InMemoryInbox {
    async fn add(
        &self,
        request_id: &RequestId,
        context_key: &str,
        body: &[u8],
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.entry(Self::key(request_id, context_key)).or_insert_with(|| InboxEntry {
            request_id: request_id.clone(),
            context_key: context_key.to_string(),
            body: body.to_vec(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn exists(
        &self,
        request_id: &RequestId,
        context_key: &str,
    ) -> Result<bool, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.contains_key(&Self::key(request_id, context_key)))
    }

    async fn get(
        &self,
        request_id: &RequestId,
        context_key: &str,
    ) -> Result<Option<InboxEntry>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.get(&Self::key(request_id, context_key)).cloned())
    }
}
