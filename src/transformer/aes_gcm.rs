use async_trait::async_trait;
use ring::aead::Aad;
use ring::aead::LessSafeKey;
use ring::aead::Nonce;
use ring::aead::UnboundKey;
use ring::aead::AES_256_GCM;
use ring::aead::NONCE_LEN;
use ring::rand::SecureRandom;
use ring::rand::SystemRandom;

use super::Context;
use super::Transformer;
use crate::Result;
use crate::TransformError;

const TRANSFORMER_NAME: &str = "aes-gcm";

/// AES-256-GCM with a random 96-bit nonce per value.
///
/// Output layout: `[nonce (12 bytes)][ciphertext + tag]`. The context's
/// authenticated data is bound as AAD.
pub struct AesGcmTransformer {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for AesGcmTransformer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("AesGcmTransformer").finish_non_exhaustive()
    }
}

impl AesGcmTransformer {
    pub fn new(key: &[u8]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| {
            TransformError::Cipher(format!("invalid AES-256 key length {}", key.len()))
        })?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn seal(
        &self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| TransformError::Cipher("failed to generate nonce".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| TransformError::Cipher("seal failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    pub fn open(
        &self,
        data: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(TransformError::Decode {
                transformer: TRANSFORMER_NAME,
                message: "the stored data was shorter than the required size".to_string(),
            }
            .into());
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| TransformError::Decode {
            transformer: TRANSFORMER_NAME,
            message: "invalid nonce".to_string(),
        })?;

        let mut in_out = sealed.to_vec();
        let plaintext_len = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| TransformError::Decode {
                transformer: TRANSFORMER_NAME,
                message: "message authentication failed".to_string(),
            })?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }
}

#[async_trait]
impl Transformer for AesGcmTransformer {
    async fn transform_from_storage(
        &self,
        data: &[u8],
        ctx: &Context,
    ) -> Result<(Vec<u8>, bool)> {
        Ok((self.open(data, ctx.authenticated_data())?, false))
    }

    async fn transform_to_storage(
        &self,
        data: &[u8],
        ctx: &Context,
    ) -> Result<Vec<u8>> {
        self.seal(data, ctx.authenticated_data())
    }
}
