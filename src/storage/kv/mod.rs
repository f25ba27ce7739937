//! Revisioned key-value capability backing the object store.
//!
//! Every successful write bumps one global revision and is appended to an
//! event log. The log makes historical range reads and resumable watches
//! possible until it is compacted.

mod maintenance;
mod memory;
mod sled_backend;
mod watch_stream;

pub use maintenance::*;
pub use memory::*;
pub use sled_backend::*;
pub(crate) use watch_stream::*;

#[cfg(test)]
pub(crate) mod kv_test_suite;
#[cfg(test)]
mod maintenance_test;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::BackendKind;
use crate::Result;
use crate::StorageConfig;
use crate::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the write that created the key
    pub create_revision: u64,
    /// Revision of the last write to the key
    pub mod_revision: u64,
    /// Number of writes since creation
    pub version: u64,
    /// Wall-clock expiry deadline in ms
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvEventType {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEvent {
    pub event_type: KvEventType,
    pub revision: u64,
    /// New state; for deletes an empty value at the deletion revision
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl KvEvent {
    pub fn key(&self) -> &str {
        &self.kv.key
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    /// Sorted by key
    pub kvs: Vec<KeyValue>,
    /// Revision the range was read at
    pub revision: u64,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    Succeeded { revision: u64 },
    /// The condition did not hold; `current` is the value it was checked against
    Failed { current: Option<KeyValue> },
}

/// Ordered change stream. A terminal `Err` is sent before the stream closes
/// abnormally.
pub type KvWatchStream = mpsc::Receiver<Result<KvEvent>>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KeyValue>>;

    /// Keys under `prefix` at `revision`; 0 reads the latest state.
    async fn range(
        &self,
        prefix: &str,
        revision: u64,
    ) -> Result<RangeResult>;

    async fn count(
        &self,
        prefix: &str,
    ) -> Result<u64>;

    /// Writes `key` only if it does not exist.
    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<u64>,
    ) -> Result<TxnOutcome>;

    /// Overwrites `key` only if its mod revision is `expected_mod_revision`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_mod_revision: u64,
        value: Vec<u8>,
        ttl: Option<u64>,
    ) -> Result<TxnOutcome>;

    /// Deletes `key` if its mod revision is `expected_mod_revision`; 0 skips
    /// the revision check.
    async fn compare_and_delete(
        &self,
        key: &str,
        expected_mod_revision: u64,
    ) -> Result<TxnOutcome>;

    /// Changes under `prefix` with revision >= `start_revision`; 0 streams
    /// only changes made after the call.
    async fn watch(
        &self,
        prefix: &str,
        start_revision: u64,
    ) -> Result<KvWatchStream>;

    fn current_revision(&self) -> u64;

    /// Drops history at or below `revision`.
    async fn compact(
        &self,
        revision: u64,
    ) -> Result<()>;

    /// Deletes every key whose deadline is at or before `now_ms` and returns
    /// the deleted keys.
    async fn expire(
        &self,
        now_ms: u64,
    ) -> Result<Vec<String>>;
}

/// Revision of a freshly created backend. No write ever carries it, so a
/// listed resource version is never zero.
pub(crate) const INITIAL_REVISION: u64 = 1;

/// Opens the backend selected by `config`.
pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn KvBackend>> {
    match config.backend {
        BackendKind::Memory => {
            info!("using in-memory kv backend");
            Ok(Arc::new(MemoryBackend::new(config.watch_buffer_size)))
        }
        BackendKind::Sled => {
            info!("opening sled kv backend at {:?}", config.db_path);
            Ok(Arc::new(SledBackend::open(&config.db_path, config.watch_buffer_size)?))
        }
    }
}

// ============== Shared helpers ============== //

/// Rewinds `data` (the state at `current`) back to `target` by undoing logged
/// events newest first.
pub(crate) fn rewind<'a, I>(
    data: &mut BTreeMap<String, KeyValue>,
    newest_first: I,
    target: u64,
) where
    I: Iterator<Item = &'a KvEvent>,
{
    for event in newest_first {
        if event.revision <= target {
            break;
        }
        match &event.prev_kv {
            Some(prev) => {
                data.insert(prev.key.clone(), prev.clone());
            }
            None => {
                data.remove(event.key());
            }
        }
    }
}

/// Validates a historical read against the retained window.
pub(crate) fn check_range_revision(
    revision: u64,
    current: u64,
    compacted: u64,
) -> Result<()> {
    if revision > current {
        return Err(StorageError::Timeout {
            requested: revision,
            current,
        }
        .into());
    }
    if revision < compacted {
        return Err(StorageError::TooOld {
            requested: revision,
            oldest: compacted,
        }
        .into());
    }
    Ok(())
}

/// Validates a watch start against the retained window.
pub(crate) fn check_watch_start(
    start_revision: u64,
    compacted: u64,
) -> Result<()> {
    if start_revision != 0 && start_revision <= compacted {
        return Err(StorageError::TooOld {
            requested: start_revision,
            oldest: compacted + 1,
        }
        .into());
    }
    Ok(())
}

pub(crate) fn new_key_value(
    key: &str,
    value: Vec<u8>,
    revision: u64,
    prev: Option<&KeyValue>,
    expires_at: Option<u64>,
) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value,
        create_revision: prev.map(|p| p.create_revision).unwrap_or(revision),
        mod_revision: revision,
        version: prev.map(|p| p.version + 1).unwrap_or(1),
        expires_at,
    }
}

pub(crate) fn tombstone(
    prev: &KeyValue,
    revision: u64,
) -> KeyValue {
    KeyValue {
        key: prev.key.clone(),
        value: Vec::new(),
        create_revision: prev.create_revision,
        mod_revision: revision,
        version: 0,
        expires_at: None,
    }
}
