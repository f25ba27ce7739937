use std::sync::Arc;

use super::*;
use crate::EncryptionConfig;
use crate::StorageMetrics;

fn aes(seed: u8) -> Arc<dyn Transformer> {
    Arc::new(AesGcmTransformer::new(&[seed; 32]).unwrap())
}

#[tokio::test]
async fn test_writes_with_first_and_tags_prefix() {
    let chain = PrefixTransformers::new(vec![
        PrefixTransformer::new("k2:", "aes-gcm", aes(2)),
        PrefixTransformer::new("k1:", "aes-gcm", aes(1)),
    ])
    .unwrap();
    let ctx = Context::default();

    let stored = chain.transform_to_storage(b"v", &ctx).await.unwrap();
    assert!(stored.starts_with(b"k2:"));

    let (plain, stale) = chain.transform_from_storage(&stored, &ctx).await.unwrap();
    assert_eq!(plain, b"v");
    assert!(!stale);
}

#[tokio::test]
async fn test_older_transformer_reads_stale() {
    let old = PrefixTransformers::new(vec![PrefixTransformer::new("k1:", "aes-gcm", aes(1))]).unwrap();
    let rotated = PrefixTransformers::new(vec![
        PrefixTransformer::new("k2:", "aes-gcm", aes(2)),
        PrefixTransformer::new("k1:", "aes-gcm", aes(1)),
    ])
    .unwrap();
    let ctx = Context::default();

    let stored = old.transform_to_storage(b"v", &ctx).await.unwrap();
    let (plain, stale) = rotated.transform_from_storage(&stored, &ctx).await.unwrap();
    assert_eq!(plain, b"v");
    assert!(stale);
}

#[tokio::test]
async fn test_unknown_prefix_is_decode_error() {
    let chain = PrefixTransformers::new(vec![PrefixTransformer::new("k1:", "aes-gcm", aes(1))]).unwrap();
    let err = chain.transform_from_storage(b"plain", &Context::default()).await.unwrap_err();
    assert!(err.to_string().contains("no matching prefix"));
}

#[test]
fn test_empty_chain_rejected() {
    assert!(PrefixTransformers::new(Vec::new()).is_err());
}

#[tokio::test]
async fn test_build_transformer_disabled_is_identity() {
    let t = build_transformer(&EncryptionConfig::default(), None, None).unwrap();
    let stored = t.transform_to_storage(b"{}", &Context::default()).await.unwrap();
    assert_eq!(stored, b"{}");
}

#[tokio::test]
async fn test_build_transformer_requires_kms() {
    let config = EncryptionConfig {
        enabled: true,
        ..Default::default()
    };
    assert!(build_transformer(&config, None, None).is_err());
}

#[tokio::test]
async fn test_build_transformer_encrypts_and_reads_legacy_plaintext() {
    let config = EncryptionConfig {
        enabled: true,
        provider_name: "local".to_string(),
        ..Default::default()
    };
    let metrics = Arc::new(StorageMetrics::new().unwrap());
    let kms: Arc<dyn KmsService> = Arc::new(StaticKeyService::generate().unwrap());
    let t = build_transformer(&config, Some(kms), Some(metrics.clone())).unwrap();
    let ctx = Context::new("/registry/secrets/a");

    let stored = t.transform_to_storage(b"{\"a\":1}", &ctx).await.unwrap();
    assert!(stored.starts_with(b"k8s:enc:kms:v1:local:"));
    let (plain, stale) = t.transform_from_storage(&stored, &ctx).await.unwrap();
    assert_eq!(plain, b"{\"a\":1}");
    assert!(!stale);

    // Written before encryption was enabled
    let (plain, stale) = t.transform_from_storage(b"{\"b\":2}", &ctx).await.unwrap();
    assert_eq!(plain, b"{\"b\":2}");
    assert!(stale);

    assert_eq!(
        metrics
            .transform_operations
            .with_label_values(&["envelope", "to_storage", "ok"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_mocked_transformer_failure_propagates() {
    let mut inner = MockTransformer::new();
    inner
        .expect_transform_to_storage()
        .returning(|_, _| Err(crate::TransformError::Cipher("boom".to_string()).into()));
    let chain = PrefixTransformers::new(vec![PrefixTransformer::new("m:", "mock", Arc::new(inner))]).unwrap();

    let err = chain.transform_to_storage(b"v", &Context::default()).await.unwrap_err();
    assert!(err.to_string().contains("boom"));
}
