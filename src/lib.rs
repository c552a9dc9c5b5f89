//! Chatkeep - bounded conversation state for chat front ends
//!
//! Holds up to N conversations in memory, evicts the least recently used
//! one to a durable store when the bound is exceeded and reloads it on the
//! next access. Conversations are grouped by session.
//!
//! ```no_run
//! use chatkeep::{storage, ConversationManager, Settings, Turn};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::new()?;
//!     let store = storage::open(&settings.storage).await?;
//!     let manager = ConversationManager::open(store, settings.cache).await?;
//!
//!     let id = "support-42".into();
//!     manager.append_turn(&id, Turn::user("Where is my order?")).await?;
//!     manager.append_turn(&id, Turn::assistant("Let me check.")).await?;
//!
//!     let context = manager.read_history(&id, Some(10)).await?;
//!     println!("{} turns of context", context.len());
//!
//!     manager.flush().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod core;
pub mod storage;
pub mod utils;

pub use crate::cache::{CacheStats, ConversationManager};
pub use crate::config::{CacheConfig, Settings, StorageBackend, StorageConfig};
pub use crate::core::{
    ConversationError, ConversationId, ConversationRecord, Role, SessionId, StoreError, Turn,
};
pub use crate::storage::ConversationStore;
