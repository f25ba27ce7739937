//! TTL expiry settings
//!
//! Keys written with a TTL carry an absolute deadline. When enabled, the
//! expiry worker sweeps the backend every `interval_ms` and deletes what has
//! lapsed; watchers see ordinary DELETED events.
//!
//! ```toml
//! [lease]
//! enabled = true
//! interval_ms = 1000
//! ```

use serde::Deserialize;
use serde::Serialize;

use crate::ConfigError;
use crate::Error;
use crate::Result;

const MIN_SWEEP_INTERVAL_MS: u64 = 100;
const MAX_SWEEP_INTERVAL_MS: u64 = 3_600_000;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LeaseConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Sweep period, 100ms to 1h
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_interval_ms(),
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled
            && !(MIN_SWEEP_INTERVAL_MS..=MAX_SWEEP_INTERVAL_MS).contains(&self.interval_ms)
        {
            return Err(Error::Config(ConfigError::Message(format!(
                "lease.interval_ms {} outside {MIN_SWEEP_INTERVAL_MS}..={MAX_SWEEP_INTERVAL_MS}",
                self.interval_ms
            ))));
        }
        Ok(())
    }
}

fn default_interval_ms() -> u64 {
    1000
}
