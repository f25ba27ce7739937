use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::Context;
use super::Transformer;
use crate::ConfigError;
use crate::Error;
use crate::Result;
use crate::StorageMetrics;
use crate::TransformError;

/// A transformer selected by the prefix of the stored value.
#[derive(Clone)]
pub struct PrefixTransformer {
    prefix: Vec<u8>,
    name: &'static str,
    transformer: Arc<dyn Transformer>,
}

impl PrefixTransformer {
    pub fn new(
        prefix: impl Into<Vec<u8>>,
        name: &'static str,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            name,
            transformer,
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

/// Ordered transformers for key rotation.
///
/// Writes use the first entry and tag the value with its prefix. Reads use
/// the first entry whose prefix matches and report the value stale unless
/// that entry is also the write transformer.
pub struct PrefixTransformers {
    transformers: Vec<PrefixTransformer>,
    metrics: Option<Arc<StorageMetrics>>,
}

impl PrefixTransformers {
    pub fn new(transformers: Vec<PrefixTransformer>) -> Result<Self> {
        if transformers.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "at least one transformer is required".to_string(),
            )));
        }
        Ok(Self {
            transformers,
            metrics: None,
        })
    }

    pub fn with_metrics(
        mut self,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(
        &self,
        name: &str,
        operation: &str,
        success: bool,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.record_transform(name, operation, success);
        }
    }
}

#[async_trait]
impl Transformer for PrefixTransformers {
    async fn transform_from_storage(
        &self,
        data: &[u8],
        ctx: &Context,
    ) -> Result<(Vec<u8>, bool)> {
        for (i, entry) in self.transformers.iter().enumerate() {
            if !data.starts_with(&entry.prefix) {
                continue;
            }
            trace!(transformer = entry.name, "reading stored value");

            let result = entry
                .transformer
                .transform_from_storage(&data[entry.prefix.len()..], ctx)
                .await;
            self.record(entry.name, "from_storage", result.is_ok());

            let (plaintext, stale) = result?;
            return Ok((plaintext, stale || i != 0));
        }

        Err(TransformError::Decode {
            transformer: "prefix",
            message: "no matching prefix found".to_string(),
        }
        .into())
    }

    async fn transform_to_storage(
        &self,
        data: &[u8],
        ctx: &Context,
    ) -> Result<Vec<u8>> {
        let entry = &self.transformers[0];
        let result = entry.transformer.transform_to_storage(data, ctx).await;
        self.record(entry.name, "to_storage", result.is_ok());

        let transformed = result?;
        let mut out = Vec::with_capacity(entry.prefix.len() + transformed.len());
        out.extend_from_slice(&entry.prefix);
        out.extend_from_slice(&transformed);
        Ok(out)
    }
}
