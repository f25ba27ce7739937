//! Value transformation between objects' encoded bytes and what the backing
//! store persists. Used for encryption at rest.

mod aes_gcm;
mod envelope;
mod kms;
mod prefix;

pub use aes_gcm::*;
pub use envelope::*;
pub use kms::*;
pub use prefix::*;

#[cfg(test)]
mod prefix_test;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::ConfigError;
use crate::EncryptionConfig;
use crate::Error;
use crate::Result;
use crate::StorageMetrics;

/// Extra data bound to a transformed value. The store passes the object's
/// key, so a ciphertext copied to another key fails to decrypt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    authenticated_data: Vec<u8>,
}

impl Context {
    pub fn new(authenticated_data: impl Into<Vec<u8>>) -> Self {
        Self {
            authenticated_data: authenticated_data.into(),
        }
    }

    pub fn authenticated_data(&self) -> &[u8] {
        &self.authenticated_data
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transformer: Send + Sync + 'static {
    /// Returns the plaintext and whether the value should be rewritten with
    /// the current write transformer.
    async fn transform_from_storage(
        &self,
        data: &[u8],
        ctx: &Context,
    ) -> Result<(Vec<u8>, bool)>;

    async fn transform_to_storage(
        &self,
        data: &[u8],
        ctx: &Context,
    ) -> Result<Vec<u8>>;
}

/// Stores values unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

#[async_trait]
impl Transformer for IdentityTransformer {
    async fn transform_from_storage(
        &self,
        data: &[u8],
        _ctx: &Context,
    ) -> Result<(Vec<u8>, bool)> {
        Ok((data.to_vec(), false))
    }

    async fn transform_to_storage(
        &self,
        data: &[u8],
        _ctx: &Context,
    ) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Builds the transformer chain described by `config`.
///
/// With encryption enabled, writes go through the envelope transformer and
/// reads also accept unencrypted values, which are reported stale.
pub fn build_transformer(
    config: &EncryptionConfig,
    kms: Option<Arc<dyn KmsService>>,
    metrics: Option<Arc<StorageMetrics>>,
) -> Result<Arc<dyn Transformer>> {
    if !config.enabled {
        return Ok(Arc::new(IdentityTransformer));
    }

    let kms = kms.ok_or_else(|| {
        Error::Config(ConfigError::Message(
            "encryption is enabled but no KMS service was provided".to_string(),
        ))
    })?;

    let mut envelope = EnvelopeTransformer::new(
        kms,
        config.dek_cache_size,
        Duration::from_millis(config.kms_timeout_ms),
    );
    if let Some(metrics) = &metrics {
        envelope = envelope.with_metrics(metrics.clone());
    }

    let mut chain = PrefixTransformers::new(vec![
        PrefixTransformer::new(kms_prefix(&config.provider_name), "envelope", Arc::new(envelope)),
        PrefixTransformer::new("", "identity", Arc::new(IdentityTransformer)),
    ])?;
    if let Some(metrics) = metrics {
        chain = chain.with_metrics(metrics);
    }

    info!(provider = %config.provider_name, "envelope encryption enabled");
    Ok(Arc::new(chain))
}
