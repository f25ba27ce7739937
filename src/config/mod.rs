//! Layered configuration: compiled defaults, then the TOML file named by
//! `CONFIG_PATH`, then optional override files, then `APISTORE__SECTION__FIELD`
//! environment variables.

mod encryption;
mod lease;
mod monitoring;
mod retry;
mod storage;
mod watch_cache;
pub use encryption::*;
pub use lease::*;
pub use monitoring::*;
pub use retry::*;
pub use storage::*;
pub use watch_cache::*;

#[cfg(test)]
mod config_test;

use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

pub(crate) const ENV_PREFIX: &str = "APISTORE";

/// Every tunable of the storage core, one section per subsystem.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ApiStoreConfig {
    /// Backing KV engine selection and key layout
    #[serde(default)]
    pub storage: StorageConfig,
    /// Watch cache window and freshness parameters
    #[serde(default)]
    pub watch_cache: WatchCacheConfig,
    /// Encryption at rest
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Retry policies for optimistic updates and relisting
    #[serde(default)]
    pub retry: RetryPolicies,
    /// TTL expiry worker
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Metrics exporter
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl ApiStoreConfig {
    /// Merges defaults, the `CONFIG_PATH` file and the environment. The
    /// result is unvalidated so more overrides can still be layered on top.
    ///
    /// ```ignore
    /// std::env::set_var("APISTORE__WATCH_CACHE__CAPACITY", "500");
    /// let cfg = ApiStoreConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        Ok(builder.add_source(env_source()).build()?.try_deserialize()?)
    }

    /// Layers the file at `path` over `self`; the environment still wins.
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
        self.storage.validate()?;
        self.watch_cache.validate()?;
        self.encryption.validate()?;
        self.retry.validate()?;
        self.lease.validate()?;
        self.monitoring.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
