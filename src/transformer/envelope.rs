use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lru::LruCache;
use parking_lot::Mutex;
use ring::rand::SecureRandom;
use ring::rand::SystemRandom;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;
use zeroize::Zeroizing;

use super::AesGcmTransformer;
use super::Context;
use super::KmsService;
use super::Transformer;
use crate::constants::DEK_LENGTH;
use crate::constants::KMS_PREFIX_BASE;
use crate::Error;
use crate::Result;
use crate::StorageError;
use crate::StorageMetrics;
use crate::TransformError;

const TRANSFORMER_NAME: &str = "envelope";

/// Stored value prefix for values wrapped by KMS provider `name`.
pub fn kms_prefix(name: &str) -> String {
    format!("{KMS_PREFIX_BASE}{name}:")
}

/// Envelope encryption: a fresh data key per write, wrapped by a KMS.
///
/// Layout: `[wrapped key length: u16 BE][wrapped key][AES-GCM ciphertext]`.
/// Unwrapped keys are cached by the base64 of their wrapped form, so
/// repeated reads of the same value do not call the KMS.
pub struct EnvelopeTransformer {
    kms: Arc<dyn KmsService>,
    cache: Mutex<LruCache<String, Arc<AesGcmTransformer>>>,
    kms_timeout: Duration,
    rng: SystemRandom,
    metrics: Option<Arc<StorageMetrics>>,
}

impl std::fmt::Debug for EnvelopeTransformer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EnvelopeTransformer")
            .field("cached_keys", &self.cache.lock().len())
            .field("kms_timeout", &self.kms_timeout)
            .finish()
    }
}

impl EnvelopeTransformer {
    pub fn new(
        kms: Arc<dyn KmsService>,
        cache_size: usize,
        kms_timeout: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            kms,
            cache: Mutex::new(LruCache::new(capacity)),
            kms_timeout,
            rng: SystemRandom::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(
        mut self,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cached_keys(&self) -> usize {
        self.cache.lock().len()
    }

    async fn call_kms<F>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<Vec<u8>>
    where
        F: Future<Output = Result<Vec<u8>>> + Send,
    {
        let start = Instant::now();
        let result = match timeout(self.kms_timeout, call).await {
            Ok(Ok(bytes)) => Ok(bytes),
            // The KMS understood the request and rejected the key bytes
            Ok(Err(Error::Transform(TransformError::Decode { message, .. })))
            | Ok(Err(Error::Storage(StorageError::Invalid { message, .. }))) => {
                Err(Self::decode_error(format!("KMS {operation} rejected the key: {message}")).into())
            }
            Ok(Err(e)) => Err(TransformError::Kms {
                operation,
                message: e.to_string(),
            }
            .into()),
            Err(_) => Err(TransformError::Kms {
                operation,
                message: format!("no response within {:?}", self.kms_timeout),
            }
            .into()),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_kms_latency(operation, start.elapsed());
        }
        if let Err(e) = &result {
            warn!("{}", e);
        }
        result
    }

    fn record_lookup(
        &self,
        hit: bool,
    ) {
        if let Some(metrics) = &self.metrics {
            let result = if hit { "hit" } else { "miss" };
            metrics.dek_cache_lookups.with_label_values(&[result]).inc();
        }
    }

    fn decode_error(message: impl Into<String>) -> TransformError {
        TransformError::Decode {
            transformer: TRANSFORMER_NAME,
            message: message.into(),
        }
    }
}

#[async_trait]
impl Transformer for EnvelopeTransformer {
    async fn transform_from_storage(
        &self,
        data: &[u8],
        ctx: &Context,
    ) -> Result<(Vec<u8>, bool)> {
        if data.len() < 2 {
            return Err(Self::decode_error("the stored data was shorter than the required size").into());
        }
        let key_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if key_len == 0 || data.len() < 2 + key_len {
            return Err(Self::decode_error(format!(
                "invalid key length {} for {} bytes of data",
                key_len,
                data.len()
            ))
            .into());
        }
        let (wrapped, ciphertext) = data[2..].split_at(key_len);

        let cache_key = STANDARD.encode(wrapped);
        let cached = self.cache.lock().get(&cache_key).cloned();
        self.record_lookup(cached.is_some());

        let sub = match cached {
            Some(sub) => sub,
            None => {
                debug!("data key cache miss, asking KMS to unwrap");
                let dek = Zeroizing::new(self.call_kms("decrypt", self.kms.decrypt(wrapped)).await?);
                let sub = Arc::new(AesGcmTransformer::new(&dek)?);
                self.cache.lock().put(cache_key, sub.clone());
                sub
            }
        };

        Ok((sub.open(ciphertext, ctx.authenticated_data())?, false))
    }

    async fn transform_to_storage(
        &self,
        data: &[u8],
        ctx: &Context,
    ) -> Result<Vec<u8>> {
        let mut dek = Zeroizing::new(vec![0u8; DEK_LENGTH]);
        self.rng
            .fill(&mut dek)
            .map_err(|_| TransformError::Cipher("failed to generate data key".to_string()))?;

        let wrapped = self.call_kms("encrypt", self.kms.encrypt(&dek)).await?;
        if wrapped.is_empty() || wrapped.len() > u16::MAX as usize {
            return Err(TransformError::Cipher(format!(
                "wrapped key length {} does not fit the envelope",
                wrapped.len()
            ))
            .into());
        }

        let sub = Arc::new(AesGcmTransformer::new(&dek)?);
        let ciphertext = sub.seal(data, ctx.authenticated_data())?;
        self.cache.lock().put(STANDARD.encode(&wrapped), sub);

        let mut out = Vec::with_capacity(2 + wrapped.len() + ciphertext.len());
        out.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
        out.extend_from_slice(&wrapped);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}
