//! Watch cache configuration
//!
//! ```toml
//! [watch_cache]
//! capacity = 100           # buffered events per resource
//! block_timeout_ms = 3000  # freshness wait budget
//! ```

use serde::Deserialize;
use serde::Serialize;

use crate::ConfigError;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchCacheConfig {
    /// Number of change events retained in the sliding window.
    ///
    /// Watches resuming from a version older than the window fail with
    /// `TooOld` and must relist.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Upper bound on how long a read waits for the cache to catch up with a
    /// requested resource version.
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Per-watcher queue length. A watcher whose queue fills is terminated.
    #[serde(default = "default_watcher_buffer_size")]
    pub watcher_buffer_size: usize,

    /// Interval between bookmark events for watchers that request them
    #[serde(default = "default_bookmark_interval_ms")]
    pub bookmark_interval_ms: u64,
}

impl Default for WatchCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            block_timeout_ms: default_block_timeout_ms(),
            watcher_buffer_size: default_watcher_buffer_size(),
            bookmark_interval_ms: default_bookmark_interval_ms(),
        }
    }
}

impl WatchCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch cache capacity must be greater than 0".to_string(),
            )));
        }

        if self.block_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "block_timeout_ms must be greater than 0".to_string(),
            )));
        }

        if self.watcher_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watcher_buffer_size must be greater than 0".to_string(),
            )));
        }

        if !(100..=3_600_000).contains(&self.bookmark_interval_ms) {
            return Err(Error::Config(ConfigError::Message(format!(
                "bookmark_interval_ms must be between 100 and 3600000, got {}",
                self.bookmark_interval_ms
            ))));
        }

        Ok(())
    }
}

fn default_capacity() -> usize {
    100
}

fn default_block_timeout_ms() -> u64 {
    3000
}

fn default_watcher_buffer_size() -> usize {
    100
}

fn default_bookmark_interval_ms() -> u64 {
    60_000
}
