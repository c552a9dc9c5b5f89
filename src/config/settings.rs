use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of conversations held in memory
    pub capacity: usize,
    /// Fail appends/reads for unknown conversations instead of creating them
    pub strict: bool,
    /// Failed eviction writes tolerated per record before callers see an error
    pub max_persist_failures: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            strict: false,
            max_persist_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Filesystem,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_env = env::var("CONFIG_ENV").unwrap_or_else(|_| "default".to_string());

        let config = Self::builder()?
            .add_source(File::with_name(&format!("config/{}", config_env)).required(false))
            .add_source(Self::environment())
            .build()?;

        Self::finish(config)
    }

    /// Load from an explicit file, still honoring environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::builder()?
            .add_source(File::from(path))
            .add_source(Self::environment())
            .build()?;

        Self::finish(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::Message(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if self.storage.backend != StorageBackend::Memory && self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::Message("storage.path must not be empty".to_string()));
        }
        Ok(())
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let defaults = CacheConfig::default();
        Config::builder()
            .set_default("cache.capacity", defaults.capacity as u64)?
            .set_default("cache.strict", defaults.strict)?
            .set_default("cache.max_persist_failures", defaults.max_persist_failures as u64)?
            .set_default("storage.backend", "filesystem")?
            .set_default("storage.path", "./conversations")?
            .set_default("logging.level", "info")
    }

    fn environment() -> Environment {
        Environment::with_prefix("APP")
            .separator("__")
            .try_parsing(true)
    }

    fn finish(config: Config) -> Result<Self, ConfigError> {
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}
