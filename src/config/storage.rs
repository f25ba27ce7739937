//! Backing KV engine configuration.
//!
//! ```toml
//! [storage]
//! backend = "sled"
//! db_path = "/var/lib/apistore/db"
//! path_prefix = "/registry"
//! compaction_interval_ms = 300000
//! ```

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::ConfigError;
use crate::Error;
use crate::Result;

/// Which [`KvBackend`](crate::KvBackend) implementation to open.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Volatile in-process store, for tests and single-shot tooling
    #[default]
    Memory,
    /// Persistent embedded store
    Sled,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Database directory, only used by the sled backend
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Prefix prepended to every object key
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Capacity of each backend watch stream before the consumer is declared lagging
    #[serde(default = "default_watch_buffer_size")]
    pub watch_buffer_size: usize,

    /// Interval of the history compaction worker; 0 disables compaction
    #[serde(default = "default_compaction_interval_ms")]
    pub compaction_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            db_path: default_db_path(),
            path_prefix: default_path_prefix(),
            watch_buffer_size: default_watch_buffer_size(),
            compaction_interval_ms: default_compaction_interval_ms(),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.path_prefix.starts_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "path_prefix must start with '/', got {:?}",
                self.path_prefix
            ))));
        }

        if self.path_prefix.len() > 1 && self.path_prefix.ends_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "path_prefix must not end with '/', got {:?}",
                self.path_prefix
            ))));
        }

        if self.watch_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch_buffer_size must be greater than 0".to_string(),
            )));
        }

        if self.backend == BackendKind::Sled && self.db_path.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "db_path is required for the sled backend".to_string(),
            )));
        }

        Ok(())
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./db/apistore")
}

fn default_path_prefix() -> String {
    "/registry".to_string()
}

fn default_watch_buffer_size() -> usize {
    1024
}

fn default_compaction_interval_ms() -> u64 {
    300_000
}
