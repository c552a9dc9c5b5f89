use super::types::ConversationId;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("invalid {kind} id: {value:?}")]
pub struct InvalidId {
    pub kind: &'static str,
    pub value: String,
}

/// Errors raised by durable store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("corrupt record for conversation {id}: {reason}")]
    Corrupt { id: ConversationId, reason: String },

    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// True when the storage medium itself could not be reached or written
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Database(_) | StoreError::Task(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the conversation manager
#[derive(Debug, Error)]
pub enum ConversationError {
    /// Only raised in strict mode
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    /// Persisting a record kept failing; the record is still held in memory
    #[error("storage unavailable for conversation {id} after {attempts} attempts: {source}")]
    StorageUnavailable {
        id: ConversationId,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("flush incomplete: {failed} record(s) could not be persisted")]
    FlushIncomplete { failed: usize },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

pub type ConversationResult<T> = Result<T, ConversationError>;
