#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use apistore::build_transformer;
use apistore::ApiStoreConfig;
use apistore::KmsService;
use apistore::KvBackend;
use apistore::KvStore;
use apistore::Object;
use apistore::ObjectMeta;
use apistore::Result;
use apistore::StaticKeyService;
use apistore::WatchEvent;
use apistore::Watcher;
use serde::Deserialize;
use serde::Serialize;

pub const KEK: [u8; 32] = [7u8; 32];
pub const PROVIDER: &str = "it";

/// Namespaced key/value bag; the payload that gets encrypted at rest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Object for ConfigMap {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub fn config_map(
    namespace: &str,
    name: &str,
    entries: &[(&str, &str)],
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: format!("uid-{namespace}-{name}"),
            ..Default::default()
        },
        data: entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    }
}

pub fn encrypted_config() -> ApiStoreConfig {
    let mut config = ApiStoreConfig::default();
    config.encryption.enabled = true;
    config.encryption.provider_name = PROVIDER.to_string();
    config.watch_cache.block_timeout_ms = 2000;
    config
}

/// Store whose values are envelope encrypted under `kek`.
pub fn encrypted_store(
    backend: Arc<dyn KvBackend>,
    config: &ApiStoreConfig,
    kek: &[u8],
) -> Result<KvStore<ConfigMap>> {
    let kms: Arc<dyn KmsService> = Arc::new(StaticKeyService::new(kek)?);
    let transformer = build_transformer(&config.encryption, Some(kms), None)?;
    Ok(KvStore::from_config(backend, "configmaps", config, transformer))
}

pub async fn next_event<W: Watcher<ConfigMap>>(watcher: &mut W) -> WatchEvent<ConfigMap> {
    tokio::time::timeout(Duration::from_secs(3), watcher.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch closed")
}

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}
