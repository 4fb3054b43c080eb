use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Basic retry policy template
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Maximum number of retries (0 means unlimited retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Single operation timeout (unit: milliseconds)
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_op_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    pub fn validate(
        &self,
        name: &str,
    ) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}.timeout_ms must be greater than 0"
            ))));
        }
        if self.base_delay_ms == 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}.base_delay_ms must be greater than 0"
            ))));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}.base_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ))));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), doubling from the base and capped.
    pub fn delay_for_attempt(
        &self,
        attempt: usize,
    ) -> Duration {
        let shift = attempt.min(32) as u32;
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

const fn default_max_retries() -> usize {
    0
}
const fn default_op_timeout_ms() -> u64 {
    30_000
}
const fn default_base_delay_ms() -> u64 {
    100
}
const fn default_max_delay_ms() -> u64 {
    30_000
}
