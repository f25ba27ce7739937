//! Encryption at rest configuration
//!
//! When enabled, every stored value passes through an envelope transformer
//! whose data keys are wrapped by the configured KMS provider. Values written
//! before encryption was enabled stay readable through the identity fallback.

use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_DEK_CACHE_SIZE;
use crate::ConfigError;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Provider name embedded in the stored value prefix
    #[serde(default = "default_provider_name")]
    pub provider_name: String,

    /// Number of decrypted data keys kept in memory
    #[serde(default = "default_dek_cache_size")]
    pub dek_cache_size: usize,

    /// Deadline for a single KMS encrypt/decrypt call
    #[serde(default = "default_kms_timeout_ms")]
    pub kms_timeout_ms: u64,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider_name: default_provider_name(),
            dek_cache_size: default_dek_cache_size(),
            kms_timeout_ms: default_kms_timeout_ms(),
        }
    }
}

impl EncryptionConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.provider_name.is_empty() || self.provider_name.contains(':') {
            return Err(Error::Config(ConfigError::Message(format!(
                "provider_name must be non-empty and must not contain ':', got {:?}",
                self.provider_name
            ))));
        }

        if self.dek_cache_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "dek_cache_size must be greater than 0".to_string(),
            )));
        }

        if self.kms_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "kms_timeout_ms must be greater than 0".to_string(),
            )));
        }

        Ok(())
    }
}

fn default_provider_name() -> String {
    "kms".to_string()
}

fn default_dek_cache_size() -> usize {
    DEFAULT_DEK_CACHE_SIZE
}

fn default_kms_timeout_ms() -> u64 {
    3000
}
