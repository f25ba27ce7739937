use serde::Deserialize;
use serde::Serialize;

use crate::ConfigError;
use crate::Error;
use crate::Result;

/// Attempt bound, per-attempt timeout and exponential delay range of one
/// retried operation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt; 0 retries forever
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Deadline of each attempt in ms
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,

    /// First delay in ms, doubled per retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Delay ceiling in ms
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicies {
    /// Compare-and-swap loop of guaranteed updates and deletes
    #[serde(default)]
    pub guaranteed_update: BackoffPolicy,

    /// Cacher relist after a broken or expired watch
    #[serde(default)]
    pub relist: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            guaranteed_update: BackoffPolicy {
                max_retries: 16,
                timeout_ms: 5000,
                base_delay_ms: 2,
                max_delay_ms: 200,
            },
            relist: BackoffPolicy {
                max_retries: 0,
                timeout_ms: 30_000,
                base_delay_ms: 100,
                max_delay_ms: 30_000,
            },
        }
    }
}

impl BackoffPolicy {
    fn validate(
        &self,
        name: &str,
    ) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}.timeout_ms must be greater than 0"
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
}

impl RetryPolicies {
    pub fn validate(&self) -> Result<()> {
        self.guaranteed_update.validate("guaranteed_update")?;
        self.relist.validate("relist")?;
        Ok(())
    }
}

fn default_max_retries() -> usize {
    3
}
fn default_op_timeout_ms() -> u64 {
    100
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    1000
}
