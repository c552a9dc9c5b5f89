//! Durable Conversation Storage Abstraction
//!
//! Information Hiding:
//! - Storage backend implementation details hidden behind trait
//! - Allows swapping between filesystem, SQLite and memory without API changes
//! - Each backend owns its session membership index and on-disk format
//!
//! The cache manager is the only caller; nothing else touches the medium.

use crate::config::{StorageBackend, StorageConfig};
use crate::core::{
    ConversationId, ConversationRecord, SessionId, SessionIndex, StoreError, StoreResult,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

pub mod filesystem;
pub mod memory;
pub mod sqlite;

pub use filesystem::FileSystemStore;
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Trait defining the durable store interface
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load a persisted record.
    /// Returns `NotFound` if nothing was ever saved under this id and
    /// `Corrupt` if the persisted bytes cannot be decoded (they are kept
    /// aside for manual recovery, never overwritten).
    async fn load(&self, id: &ConversationId) -> StoreResult<ConversationRecord>;

    /// Atomically replace the persisted copy of a record
    async fn save(&self, record: &ConversationRecord) -> StoreResult<()>;

    /// Remove a record and its session membership. Idempotent.
    async fn delete(&self, id: &ConversationId) -> StoreResult<()>;

    /// Record that a conversation was created under a session. Idempotent.
    async fn register(&self, session: &SessionId, id: &ConversationId) -> StoreResult<()>;

    /// Conversations created under a session
    async fn list_by_session(&self, session: &SessionId) -> StoreResult<BTreeSet<ConversationId>>;

    /// Full membership index, used to seed the cache on startup
    async fn session_index(&self) -> StoreResult<SessionIndex>;

    /// Check if a record has been persisted
    async fn exists(&self, id: &ConversationId) -> StoreResult<bool> {
        match self.load(id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(StoreError::Corrupt { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

/// Build the configured backend
pub async fn open(config: &StorageConfig) -> StoreResult<Arc<dyn ConversationStore>> {
    let store: Arc<dyn ConversationStore> = match config.backend {
        StorageBackend::Filesystem => Arc::new(FileSystemStore::new(config.path.clone()).await?),
        StorageBackend::Sqlite => Arc::new(SqliteStore::open(config.path.clone()).await?),
        StorageBackend::Memory => Arc::new(InMemoryStore::new()),
    };

    tracing::info!(backend = ?config.backend, path = ?config.path, "Conversation store opened");
    Ok(store)
}
