pub mod manager;

pub use manager::{CacheStats, ConversationManager};
