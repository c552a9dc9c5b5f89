//! In-Memory Conversation Storage
//!
//! Information Hiding:
//! - HashMap storage structure hidden from users
//! - Thread-safe access via RwLock hidden behind async interface
//! - Suitable for testing and ephemeral deployments

use super::ConversationStore;
use crate::core::{
    ConversationId, ConversationRecord, SessionId, SessionIndex, StoreError, StoreResult,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    records: HashMap<ConversationId, ConversationRecord>,
    index: SessionIndex,
}

/// In-memory store; data is lost when the process terminates
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted records
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load(&self, id: &ConversationId) -> StoreResult<ConversationRecord> {
        let inner = self.inner.read().await;
        let record = inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        tracing::debug!(
            "[InMemoryStore] Loaded {} turns for conversation '{}'",
            record.len(),
            id
        );
        Ok(record)
    }

    async fn save(&self, record: &ConversationRecord) -> StoreResult<()> {
        let mut stored = record.clone();
        stored.dirty = false;

        let mut inner = self.inner.write().await;
        inner.records.insert(record.id.clone(), stored);
        tracing::debug!(
            "[InMemoryStore] Saved {} turns for conversation '{}'",
            record.len(),
            record.id
        );
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.records.remove(id);
        inner.index.remove(id);
        tracing::debug!("[InMemoryStore] Deleted conversation '{}'", id);
        Ok(())
    }

    async fn register(&self, session: &SessionId, id: &ConversationId) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .index
            .insert(session.clone(), id.clone());
        Ok(())
    }

    async fn list_by_session(&self, session: &SessionId) -> StoreResult<BTreeSet<ConversationId>> {
        Ok(self.inner.read().await.index.list(session))
    }

    async fn session_index(&self) -> StoreResult<SessionIndex> {
        Ok(self.inner.read().await.index.clone())
    }

    async fn exists(&self, id: &ConversationId) -> StoreResult<bool> {
        Ok(self.inner.read().await.records.contains_key(id))
    }
}
