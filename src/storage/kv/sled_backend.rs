//! Persistent [`KvBackend`] on sled.
//!
//! Three trees share one database:
//! - `kv`: key -> bincode [`KeyValue`]
//! - `events`: big-endian revision -> bincode [`KvEvent`]
//! - `meta`: current and compacted revisions
//!
//! Every write touches all three inside one multi-tree transaction.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use sled::transaction::TransactionResult;
use sled::Transactional;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::check_range_revision;
use super::check_watch_start;
use super::new_key_value;
use super::rewind;
use super::spawn_watch_stream;
use super::tombstone;
use super::INITIAL_REVISION;
use super::KeyValue;
use super::KvBackend;
use super::KvEvent;
use super::KvEventType;
use super::KvWatchStream;
use super::RangeResult;
use super::TxnOutcome;
use crate::constants::EVENTS_TREE;
use crate::constants::KV_TREE;
use crate::constants::META_KEY_COMPACTED_REVISION;
use crate::constants::META_KEY_CURRENT_REVISION;
use crate::constants::META_TREE;
use crate::utils::time::expiry_from_ttl;
use crate::utils::time::now_ms;
use crate::Result;
use crate::StorageError;

#[derive(Debug, Default)]
struct Cursor {
    revision: u64,
    compacted: u64,
}

pub struct SledBackend {
    db: sled::Db,
    kv_tree: sled::Tree,
    events_tree: sled::Tree,
    meta_tree: sled::Tree,

    /// Serializes writers and pins the revision seen by readers
    cursor: Mutex<Cursor>,

    events_tx: broadcast::Sender<KvEvent>,
    watch_buffer_size: usize,
}

impl std::fmt::Debug for SledBackend {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SledBackend")
            .field("kv_len", &self.kv_tree.len())
            .field("events_len", &self.events_tree.len())
            .finish()
    }
}

fn rev_key(revision: u64) -> [u8; 8] {
    revision.to_be_bytes()
}

fn read_u64(
    tree: &sled::Tree,
    key: &str,
) -> Result<u64> {
    match tree.get(key)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                StorageError::DbError(format!("corrupt meta entry {key}: {} bytes", bytes.len()))
            })?;
            Ok(u64::from_be_bytes(raw))
        }
        None => Ok(0),
    }
}

fn decode_kv(bytes: &[u8]) -> Result<KeyValue> {
    Ok(bincode::deserialize(bytes)?)
}

fn decode_event(bytes: &[u8]) -> Result<KvEvent> {
    Ok(bincode::deserialize(bytes)?)
}

impl SledBackend {
    pub fn open(
        path: impl AsRef<Path>,
        watch_buffer_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::Config::default()
            .path(path)
            .use_compression(true)
            .compression_factor(1)
            .open()
            .map_err(|e| {
                warn!("Try to open DB at this location: {:?} and failed: {:?}", path, e);
                e
            })?;
        Self::from_db(db, watch_buffer_size)
    }

    pub fn from_db(
        db: sled::Db,
        watch_buffer_size: usize,
    ) -> Result<Self> {
        let kv_tree = db.open_tree(KV_TREE)?;
        let events_tree = db.open_tree(EVENTS_TREE)?;
        let meta_tree = db.open_tree(META_TREE)?;

        let cursor = Cursor {
            revision: read_u64(&meta_tree, META_KEY_CURRENT_REVISION)?.max(INITIAL_REVISION),
            compacted: read_u64(&meta_tree, META_KEY_COMPACTED_REVISION)?,
        };
        info!(
            revision = cursor.revision,
            compacted = cursor.compacted,
            "opened sled kv backend"
        );

        let (events_tx, _) = broadcast::channel(watch_buffer_size.max(1));
        Ok(Self {
            db,
            kv_tree,
            events_tree,
            meta_tree,
            cursor: Mutex::new(cursor),
            events_tx,
            watch_buffer_size,
        })
    }

    /// Flushes dirty buffers to disk, returning the number of bytes flushed.
    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }

    fn read_kv(
        &self,
        key: &str,
    ) -> Result<Option<KeyValue>> {
        self.kv_tree.get(key)?.map(|bytes| decode_kv(&bytes)).transpose()
    }

    fn scan(
        &self,
        prefix: &str,
    ) -> Result<BTreeMap<String, KeyValue>> {
        let mut data = BTreeMap::new();
        for item in self.kv_tree.scan_prefix(prefix) {
            let (_, bytes) = item?;
            let kv = decode_kv(&bytes)?;
            data.insert(kv.key.clone(), kv);
        }
        Ok(data)
    }

    /// Logged events with revision >= `from`, oldest first.
    fn events_from(
        &self,
        from: u64,
        prefix: &str,
    ) -> Result<Vec<KvEvent>> {
        let mut events = Vec::new();
        for item in self.events_tree.range(rev_key(from)..) {
            let (_, bytes) = item?;
            let event = decode_event(&bytes)?;
            if event.key().starts_with(prefix) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn commit(
        &self,
        cursor: &mut Cursor,
        event: KvEvent,
    ) -> Result<u64> {
        let revision = event.revision;
        let rev_bytes = rev_key(revision);
        let event_bytes = bincode::serialize(&event)?;
        let kv_bytes = match event.event_type {
            KvEventType::Put => Some(bincode::serialize(&event.kv)?),
            KvEventType::Delete => None,
        };
        let key = event.key().as_bytes();

        let result: TransactionResult<(), ()> = (&self.kv_tree, &self.events_tree, &self.meta_tree)
            .transaction(|(kv, events, meta)| {
                match &kv_bytes {
                    Some(bytes) => {
                        kv.insert(key, bytes.as_slice())?;
                    }
                    None => {
                        kv.remove(key)?;
                    }
                }
                events.insert(&rev_bytes[..], event_bytes.as_slice())?;
                meta.insert(META_KEY_CURRENT_REVISION.as_bytes(), &rev_bytes[..])?;
                Ok(())
            });
        result.map_err(|e| StorageError::DbError(format!("transaction at revision {revision} failed: {e:?}")))?;

        cursor.revision = revision;
        let _ = self.events_tx.send(event);
        Ok(revision)
    }
}

#[async_trait]
impl KvBackend for SledBackend {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KeyValue>> {
        self.read_kv(key)
    }

    async fn range(
        &self,
        prefix: &str,
        revision: u64,
    ) -> Result<RangeResult> {
        let cursor = self.cursor.lock();
        let mut data = self.scan(prefix)?;

        if revision == 0 || revision == cursor.revision {
            return Ok(RangeResult {
                kvs: data.into_values().collect(),
                revision: cursor.revision,
            });
        }

        check_range_revision(revision, cursor.revision, cursor.compacted)?;

        let mut undo = self.events_from(revision + 1, prefix)?;
        undo.reverse();
        rewind(&mut data, undo.iter(), revision);
        Ok(RangeResult {
            kvs: data.into_values().collect(),
            revision,
        })
    }

    async fn count(
        &self,
        prefix: &str,
    ) -> Result<u64> {
        Ok(self.kv_tree.scan_prefix(prefix).count() as u64)
    }

    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<u64>,
    ) -> Result<TxnOutcome> {
        let mut cursor = self.cursor.lock();
        if let Some(current) = self.read_kv(key)? {
            return Ok(TxnOutcome::Failed {
                current: Some(current),
            });
        }

        let revision = cursor.revision + 1;
        let event = KvEvent {
            event_type: KvEventType::Put,
            revision,
            kv: new_key_value(key, value, revision, None, expiry_from_ttl(ttl, now_ms())),
            prev_kv: None,
        };
        Ok(TxnOutcome::Succeeded {
            revision: self.commit(&mut cursor, event)?,
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_mod_revision: u64,
        value: Vec<u8>,
        ttl: Option<u64>,
    ) -> Result<TxnOutcome> {
        let mut cursor = self.cursor.lock();
        let prev = match self.read_kv(key)? {
            Some(current) if current.mod_revision == expected_mod_revision => current,
            current => return Ok(TxnOutcome::Failed { current }),
        };

        let revision = cursor.revision + 1;
        let event = KvEvent {
            event_type: KvEventType::Put,
            revision,
            kv: new_key_value(key, value, revision, Some(&prev), expiry_from_ttl(ttl, now_ms())),
            prev_kv: Some(prev),
        };
        Ok(TxnOutcome::Succeeded {
            revision: self.commit(&mut cursor, event)?,
        })
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected_mod_revision: u64,
    ) -> Result<TxnOutcome> {
        let mut cursor = self.cursor.lock();
        let prev = match self.read_kv(key)? {
            Some(current)
                if expected_mod_revision == 0 || current.mod_revision == expected_mod_revision =>
            {
                current
            }
            current => return Ok(TxnOutcome::Failed { current }),
        };

        let revision = cursor.revision + 1;
        let event = KvEvent {
            event_type: KvEventType::Delete,
            revision,
            kv: tombstone(&prev, revision),
            prev_kv: Some(prev),
        };
        Ok(TxnOutcome::Succeeded {
            revision: self.commit(&mut cursor, event)?,
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        start_revision: u64,
    ) -> Result<KvWatchStream> {
        let cursor = self.cursor.lock();
        check_watch_start(start_revision, cursor.compacted)?;

        let live = self.events_tx.subscribe();
        let history = if start_revision == 0 {
            Vec::new()
        } else {
            self.events_from(start_revision, prefix)?
        };
        let replayed_through = cursor.revision;
        drop(cursor);

        Ok(spawn_watch_stream(
            history,
            live,
            prefix.to_string(),
            replayed_through,
            self.watch_buffer_size,
        ))
    }

    fn current_revision(&self) -> u64 {
        self.cursor.lock().revision
    }

    async fn compact(
        &self,
        revision: u64,
    ) -> Result<()> {
        let mut cursor = self.cursor.lock();
        if revision > cursor.revision {
            return Err(StorageError::invalid(
                "compact",
                format!(
                    "required revision {} is a future revision (current {})",
                    revision, cursor.revision
                ),
            )
            .into());
        }
        if revision <= cursor.compacted {
            return Ok(());
        }

        let mut doomed = Vec::new();
        for item in self.events_tree.range(..=rev_key(revision)) {
            let (key, _) = item?;
            doomed.push(key);
        }
        let rev_bytes = rev_key(revision);

        let result: TransactionResult<(), ()> =
            (&self.events_tree, &self.meta_tree).transaction(|(events, meta)| {
                for key in &doomed {
                    events.remove(key)?;
                }
                meta.insert(META_KEY_COMPACTED_REVISION.as_bytes(), &rev_bytes[..])?;
                Ok(())
            });
        result.map_err(|e| StorageError::DbError(format!("compaction to {revision} failed: {e:?}")))?;

        cursor.compacted = revision;
        debug!(revision, removed = doomed.len(), "compacted sled history");
        Ok(())
    }

    async fn expire(
        &self,
        now_ms: u64,
    ) -> Result<Vec<String>> {
        let mut candidates = Vec::new();
        for item in self.kv_tree.iter() {
            let (_, bytes) = item?;
            let kv = decode_kv(&bytes)?;
            if kv.expires_at.is_some_and(|deadline| deadline <= now_ms) {
                candidates.push((kv.key, kv.mod_revision));
            }
        }

        let mut expired = Vec::with_capacity(candidates.len());
        for (key, mod_revision) in candidates {
            if let TxnOutcome::Succeeded { .. } = self.compare_and_delete(&key, mod_revision).await? {
                expired.push(key);
            }
        }
        Ok(expired)
    }
}
