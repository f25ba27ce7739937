use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use ring::rand::SecureRandom;
use ring::rand::SystemRandom;
use zeroize::Zeroizing;

use super::AesGcmTransformer;
use crate::constants::DEK_LENGTH;
use crate::Error;
use crate::Result;
use crate::TransformError;

/// Key management service wrapping and unwrapping data encryption keys.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KmsService: Send + Sync + 'static {
    async fn encrypt(
        &self,
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    async fn decrypt(
        &self,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;
}

/// Local [`KmsService`] wrapping keys with a fixed key-encryption key.
#[derive(Debug)]
pub struct StaticKeyService {
    kek: AesGcmTransformer,
}

impl StaticKeyService {
    pub fn new(kek: &[u8]) -> Result<Self> {
        Ok(Self {
            kek: AesGcmTransformer::new(kek)?,
        })
    }

    /// Service with a freshly generated key-encryption key.
    pub fn generate() -> Result<Self> {
        let mut kek = Zeroizing::new(vec![0u8; DEK_LENGTH]);
        SystemRandom::new()
            .fill(&mut kek)
            .map_err(|_| TransformError::Cipher("failed to generate key-encryption key".to_string()))?;
        Self::new(&kek)
    }
}

#[async_trait]
impl KmsService for StaticKeyService {
    async fn encrypt(
        &self,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        self.kek.seal(plaintext, &[])
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        self.kek.open(ciphertext, &[]).map_err(|e| match e {
            Error::Transform(TransformError::Decode { message, .. }) => TransformError::Decode {
                transformer: "kms",
                message,
            }
            .into(),
            other => other,
        })
    }
}
