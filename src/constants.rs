// -
// Envelope encryption

/// Number of decrypted data keys kept by the envelope transformer
pub(crate) const DEFAULT_DEK_CACHE_SIZE: usize = 1000;

/// Length in bytes of a freshly generated data encryption key (AES-256)
pub(crate) const DEK_LENGTH: usize = 32;

/// Stored value prefix of envelope-encrypted values: `k8s:enc:kms:v1:{provider}:`
pub(crate) const KMS_PREFIX_BASE: &str = "k8s:enc:kms:v1:";

// -
// Database namespaces

/// Sled database tree namespaces
pub(crate) const KV_TREE: &str = "_apistore_kv";
pub(crate) const EVENTS_TREE: &str = "_apistore_events";
pub(crate) const META_TREE: &str = "_apistore_meta";

/// Sled entry keys in the meta tree
pub(crate) const META_KEY_CURRENT_REVISION: &str = "_current_revision";
pub(crate) const META_KEY_COMPACTED_REVISION: &str = "_compacted_revision";

// -
// Continuation tokens

pub(crate) const CONTINUE_TOKEN_VERSION: &str = "apistore/v1";

// -
// Well-known field selectors

pub const FIELD_METADATA_NAME: &str = "metadata.name";
pub const FIELD_METADATA_NAMESPACE: &str = "metadata.namespace";
