//! Conversation data model shared by the cache and the stores

pub mod error;
pub mod record;
pub mod session_index;
pub mod types;

pub use error::{ConversationError, ConversationResult, InvalidId, StoreError, StoreResult};
pub use record::{ConversationEvent, ConversationRecord, ModelUsage};
pub use session_index::SessionIndex;
pub use types::{ConversationId, Role, SessionId, Turn};
