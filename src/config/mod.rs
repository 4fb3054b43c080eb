//! Configuration management for the watch cache.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support
//! - Environment variable overrides
//! - Component-wise validation
mod cache;
mod retry;
pub use cache::*;
pub use retry::*;

#[cfg(test)]
mod config_test;

use std::env;
use std::fmt::Debug;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::CONFIG_ENV_PREFIX;
use crate::Error;
use crate::Result;

/// Main configuration container for a [`Cacher`](crate::Cacher)
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone)]
pub struct CacherConfig {
    /// Key prefix under which every cached object lives, e.g. `/registry/pods`
    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,

    /// Serve unset-version reads from the cache once it has caught up
    /// with the backing store's current version
    #[serde(default)]
    pub consistent_reads_from_cache: bool,

    /// Ring buffer sizing and freshness waits
    #[serde(default)]
    pub watch_cache: WatchCacheConfig,

    /// Fan-out queue sizes and the shared dispatch budget
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Bookmark frequency and scheduler tick
    #[serde(default)]
    pub bookmark: BookmarkConfig,

    /// List/watch retry behaviour against the backing store
    #[serde(default)]
    pub reflector: ReflectorConfig,
}

impl Default for CacherConfig {
    fn default() -> Self {
        Self {
            resource_prefix: default_resource_prefix(),
            consistent_reads_from_cache: false,
            watch_cache: WatchCacheConfig::default(),
            dispatch: DispatchConfig::default(),
            bookmark: BookmarkConfig::default(),
            reflector: ReflectorConfig::default(),
        }
    }
}

impl Debug for CacherConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CacherConfig")
            .field("resource_prefix", &self.resource_prefix)
            .field("consistent_reads_from_cache", &self.consistent_reads_from_cache)
            .field("watch_cache", &self.watch_cache)
            .finish()
    }
}

impl CacherConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Configuration sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults (lowest priority)
    /// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables with `CACHER__` prefix (highest priority)
    ///
    /// # Note
    /// Validation is deferred so that `with_override_config()` can still be applied.
    /// Callers MUST call `validate()` before using the configuration.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("CACHER__WATCH_CACHE__LOWER_BOUND_CAPACITY", "1000");
    /// let cfg = CacherConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(env_source());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional configuration overrides from file without validation.
    ///
    /// Merging order (later sources override earlier):
    /// 1. Current configuration values
    /// 2. New configuration file
    /// 3. Latest environment variables (highest priority)
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every subsystem and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        if self.resource_prefix.is_empty() || !self.resource_prefix.starts_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "resource_prefix must be an absolute key prefix, got {:?}",
                self.resource_prefix
            ))));
        }
        self.watch_cache.validate()?;
        self.dispatch.validate()?;
        self.bookmark.validate()?;
        self.reflector.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(CONFIG_ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}

fn default_resource_prefix() -> String {
    "/registry".to_string()
}
