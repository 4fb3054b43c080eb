use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Sizing of the versioned ring buffer
///
/// The buffer starts at `lower_bound_capacity` and grows (doubling) while the
/// oldest retained event is younger than `event_fresh_duration_ms`, up to
/// `upper_bound_capacity`. It shrinks back when events stay around much longer
/// than needed.
///
/// # Example
/// ```toml
/// [watch_cache]
/// lower_bound_capacity = 100
/// upper_bound_capacity = 102400
/// event_fresh_duration_ms = 75000
/// wait_until_fresh_timeout_ms = 3000
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchCacheConfig {
    /// Minimum number of retained events
    ///
    /// **Default**: 100
    #[serde(default = "default_lower_bound_capacity")]
    pub lower_bound_capacity: usize,

    /// Maximum number of retained events
    ///
    /// **Performance Impact**:
    /// - Memory: one `Arc` per slot plus the event itself while retained
    ///
    /// **Default**: 102400
    #[serde(default = "default_upper_bound_capacity")]
    pub upper_bound_capacity: usize,

    /// How long an event should stay in the buffer for reconnecting watchers
    ///
    /// **Default**: 75000 (75s)
    #[serde(default = "default_event_fresh_duration_ms")]
    pub event_fresh_duration_ms: u64,

    /// How long a read waits for the cache to reach a requested version
    ///
    /// **Default**: 3000
    #[serde(default = "default_wait_until_fresh_timeout_ms")]
    pub wait_until_fresh_timeout_ms: u64,
}

impl Default for WatchCacheConfig {
    fn default() -> Self {
        Self {
            lower_bound_capacity: default_lower_bound_capacity(),
            upper_bound_capacity: default_upper_bound_capacity(),
            event_fresh_duration_ms: default_event_fresh_duration_ms(),
            wait_until_fresh_timeout_ms: default_wait_until_fresh_timeout_ms(),
        }
    }
}

impl WatchCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lower_bound_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch_cache.lower_bound_capacity must be greater than 0".into(),
            )));
        }

        if self.upper_bound_capacity < self.lower_bound_capacity {
            return Err(Error::Config(ConfigError::Message(format!(
                "watch_cache.upper_bound_capacity ({}) must be >= lower_bound_capacity ({})",
                self.upper_bound_capacity, self.lower_bound_capacity
            ))));
        }

        if self.upper_bound_capacity > 1_000_000 {
            warn!(
                "watch_cache.upper_bound_capacity ({}) is very large and may consume significant memory",
                self.upper_bound_capacity
            );
        }

        if self.wait_until_fresh_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch_cache.wait_until_fresh_timeout_ms must be greater than 0".into(),
            )));
        }

        Ok(())
    }

    pub fn event_fresh_duration(&self) -> Duration {
        Duration::from_millis(self.event_fresh_duration_ms)
    }

    pub fn wait_until_fresh_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_until_fresh_timeout_ms)
    }
}

/// Fan-out from the ring buffer to cache watchers
///
/// # Example
/// ```toml
/// [dispatch]
/// incoming_buffer_size = 100
/// watcher_channel_size = 10
/// timeout_budget_max_ms = 100
/// timeout_budget_refresh_per_second_ms = 50
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Soft limit on events queued between the ring buffer and the dispatcher.
    /// The reflector stops applying backing-store events while it is reached.
    ///
    /// **Default**: 100
    #[serde(default = "default_incoming_buffer_size")]
    pub incoming_buffer_size: usize,

    /// Capacity of each watcher's input and result channels
    ///
    /// **Default**: 10
    #[serde(default = "default_watcher_channel_size")]
    pub watcher_channel_size: usize,

    /// Upper bound of the time a single dispatch may spend waiting on blocked watchers
    ///
    /// **Default**: 100
    #[serde(default = "default_timeout_budget_max_ms")]
    pub timeout_budget_max_ms: u64,

    /// Budget refilled per elapsed second
    ///
    /// **Default**: 50
    #[serde(default = "default_timeout_budget_refresh_per_second_ms")]
    pub timeout_budget_refresh_per_second_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            incoming_buffer_size: default_incoming_buffer_size(),
            watcher_channel_size: default_watcher_channel_size(),
            timeout_budget_max_ms: default_timeout_budget_max_ms(),
            timeout_budget_refresh_per_second_ms: default_timeout_budget_refresh_per_second_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.incoming_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "dispatch.incoming_buffer_size must be greater than 0".into(),
            )));
        }

        if self.watcher_channel_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "dispatch.watcher_channel_size must be greater than 0".into(),
            )));
        }

        if self.watcher_channel_size > 1000 {
            warn!(
                "dispatch.watcher_channel_size ({}) is very large, every watcher holds two such channels",
                self.watcher_channel_size
            );
        }

        if self.timeout_budget_refresh_per_second_ms > 1000 {
            return Err(Error::Config(ConfigError::Message(format!(
                "dispatch.timeout_budget_refresh_per_second_ms must be <= 1000, got {}",
                self.timeout_budget_refresh_per_second_ms
            ))));
        }

        Ok(())
    }

    pub fn timeout_budget_max(&self) -> Duration {
        Duration::from_millis(self.timeout_budget_max_ms)
    }

    pub fn timeout_budget_refresh_per_second(&self) -> Duration {
        Duration::from_millis(self.timeout_budget_refresh_per_second_ms)
    }
}

/// Bookmark scheduling
///
/// # Example
/// ```toml
/// [bookmark]
/// frequency_ms = 60000
/// tick_interval_ms = 1000
/// tick_jitter_factor = 0.25
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BookmarkConfig {
    /// Interval between two bookmarks sent to the same watcher
    ///
    /// **Default**: 60000
    #[serde(default = "default_bookmark_frequency_ms")]
    pub frequency_ms: u64,

    /// Scheduler tick; bookmark deadlines are bucketed to whole seconds
    ///
    /// **Default**: 1000
    #[serde(default = "default_bookmark_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Random jitter applied to every tick, as a fraction of `tick_interval_ms`
    ///
    /// **Default**: 0.25
    #[serde(default = "default_bookmark_tick_jitter_factor")]
    pub tick_jitter_factor: f64,
}

impl Default for BookmarkConfig {
    fn default() -> Self {
        Self {
            frequency_ms: default_bookmark_frequency_ms(),
            tick_interval_ms: default_bookmark_tick_interval_ms(),
            tick_jitter_factor: default_bookmark_tick_jitter_factor(),
        }
    }
}

impl BookmarkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frequency_ms < 1000 {
            return Err(Error::Config(ConfigError::Message(format!(
                "bookmark.frequency_ms must be at least 1000, got {}",
                self.frequency_ms
            ))));
        }

        if self.tick_interval_ms == 0 || self.tick_interval_ms > self.frequency_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "bookmark.tick_interval_ms must be in 1..={}, got {}",
                self.frequency_ms, self.tick_interval_ms
            ))));
        }

        if !(0.0..1.0).contains(&self.tick_jitter_factor) {
            return Err(Error::Config(ConfigError::Message(format!(
                "bookmark.tick_jitter_factor must be in [0, 1), got {}",
                self.tick_jitter_factor
            ))));
        }

        Ok(())
    }

    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }
}

/// List/watch loop against the backing store
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReflectorConfig {
    /// Retry policy for the initial list and every relist
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Pause before relisting after the backing-store watch ended
    ///
    /// **Default**: 1000
    #[serde(default = "default_relist_delay_ms")]
    pub relist_delay_ms: u64,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            relist_delay_ms: default_relist_delay_ms(),
        }
    }
}

impl ReflectorConfig {
    pub fn validate(&self) -> Result<()> {
        self.backoff.validate("reflector.backoff")
    }

    pub fn relist_delay(&self) -> Duration {
        Duration::from_millis(self.relist_delay_ms)
    }
}

const fn default_lower_bound_capacity() -> usize {
    100
}
const fn default_upper_bound_capacity() -> usize {
    100 * 1024
}
const fn default_event_fresh_duration_ms() -> u64 {
    75_000
}
const fn default_wait_until_fresh_timeout_ms() -> u64 {
    3_000
}
const fn default_incoming_buffer_size() -> usize {
    100
}
const fn default_watcher_channel_size() -> usize {
    10
}
const fn default_timeout_budget_max_ms() -> u64 {
    100
}
const fn default_timeout_budget_refresh_per_second_ms() -> u64 {
    50
}
const fn default_bookmark_frequency_ms() -> u64 {
    60_000
}
const fn default_bookmark_tick_interval_ms() -> u64 {
    1_000
}
const fn default_bookmark_tick_jitter_factor() -> f64 {
    0.25
}
const fn default_relist_delay_ms() -> u64 {
    1_000
}
