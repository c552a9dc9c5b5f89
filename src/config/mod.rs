mod settings;

pub use settings::{CacheConfig, LoggingConfig, Settings, StorageBackend, StorageConfig};
