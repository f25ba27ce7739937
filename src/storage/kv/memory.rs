use std::collections::BTreeMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

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
use crate::utils::time::expiry_from_ttl;
use crate::utils::time::now_ms;
use crate::Result;
use crate::StorageError;

#[derive(Debug, Default)]
struct MemoryState {
    data: BTreeMap<String, KeyValue>,
    history: VecDeque<KvEvent>,
    revision: u64,
    compacted_revision: u64,
}

/// Volatile [`KvBackend`]. All state lives behind one mutex; live events are
/// published while it is held so subscribers observe revision order.
///
/// Every write is kept in the event history until [`KvBackend::compact`]
/// drops it. Long-running instances need the compaction worker started by
/// `spawn_maintenance` (`storage.compaction_interval_ms`), otherwise history
/// grows with every write.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    events_tx: broadcast::Sender<KvEvent>,
    watch_buffer_size: usize,
}

impl MemoryBackend {
    pub fn new(watch_buffer_size: usize) -> Self {
        let (events_tx, _) = broadcast::channel(watch_buffer_size.max(1));
        Self {
            state: Mutex::new(MemoryState {
                revision: INITIAL_REVISION,
                ..Default::default()
            }),
            events_tx,
            watch_buffer_size,
        }
    }

    fn apply(
        &self,
        state: &mut MemoryState,
        event: KvEvent,
    ) -> u64 {
        match event.event_type {
            KvEventType::Put => {
                state.data.insert(event.kv.key.clone(), event.kv.clone());
            }
            KvEventType::Delete => {
                state.data.remove(event.key());
            }
        }
        state.revision = event.revision;
        state.history.push_back(event.clone());
        // No receivers is fine
        let _ = self.events_tx.send(event);
        state.revision
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<KeyValue>> {
        Ok(self.state.lock().data.get(key).cloned())
    }

    async fn range(
        &self,
        prefix: &str,
        revision: u64,
    ) -> Result<RangeResult> {
        let state = self.state.lock();
        let in_prefix = |k: &String| k.starts_with(prefix);

        if revision == 0 || revision == state.revision {
            return Ok(RangeResult {
                kvs: state
                    .data
                    .range(prefix.to_string()..)
                    .take_while(|(k, _)| in_prefix(k))
                    .map(|(_, v)| v.clone())
                    .collect(),
                revision: state.revision,
            });
        }

        check_range_revision(revision, state.revision, state.compacted_revision)?;

        let mut snapshot = state.data.clone();
        rewind(&mut snapshot, state.history.iter().rev(), revision);
        Ok(RangeResult {
            kvs: snapshot.into_values().filter(|kv| in_prefix(&kv.key)).collect(),
            revision,
        })
    }

    async fn count(
        &self,
        prefix: &str,
    ) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.data.keys().filter(|k| k.starts_with(prefix)).count() as u64)
    }

    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<u64>,
    ) -> Result<TxnOutcome> {
        let mut state = self.state.lock();
        if let Some(current) = state.data.get(key) {
            return Ok(TxnOutcome::Failed {
                current: Some(current.clone()),
            });
        }

        let revision = state.revision + 1;
        let kv = new_key_value(key, value, revision, None, expiry_from_ttl(ttl, now_ms()));
        let event = KvEvent {
            event_type: KvEventType::Put,
            revision,
            kv,
            prev_kv: None,
        };
        Ok(TxnOutcome::Succeeded {
            revision: self.apply(&mut state, event),
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_mod_revision: u64,
        value: Vec<u8>,
        ttl: Option<u64>,
    ) -> Result<TxnOutcome> {
        let mut state = self.state.lock();
        let prev = match state.data.get(key) {
            Some(current) if current.mod_revision == expected_mod_revision => current.clone(),
            current => {
                return Ok(TxnOutcome::Failed {
                    current: current.cloned(),
                })
            }
        };

        let revision = state.revision + 1;
        let kv = new_key_value(key, value, revision, Some(&prev), expiry_from_ttl(ttl, now_ms()));
        let event = KvEvent {
            event_type: KvEventType::Put,
            revision,
            kv,
            prev_kv: Some(prev),
        };
        Ok(TxnOutcome::Succeeded {
            revision: self.apply(&mut state, event),
        })
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected_mod_revision: u64,
    ) -> Result<TxnOutcome> {
        let mut state = self.state.lock();
        let prev = match state.data.get(key) {
            Some(current)
                if expected_mod_revision == 0 || current.mod_revision == expected_mod_revision =>
            {
                current.clone()
            }
            current => {
                return Ok(TxnOutcome::Failed {
                    current: current.cloned(),
                })
            }
        };

        let revision = state.revision + 1;
        let event = KvEvent {
            event_type: KvEventType::Delete,
            revision,
            kv: tombstone(&prev, revision),
            prev_kv: Some(prev),
        };
        Ok(TxnOutcome::Succeeded {
            revision: self.apply(&mut state, event),
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        start_revision: u64,
    ) -> Result<KvWatchStream> {
        let state = self.state.lock();
        check_watch_start(start_revision, state.compacted_revision)?;

        let live = self.events_tx.subscribe();
        let history: Vec<KvEvent> = if start_revision == 0 {
            Vec::new()
        } else {
            state
                .history
                .iter()
                .filter(|e| e.revision >= start_revision && e.key().starts_with(prefix))
                .cloned()
                .collect()
        };
        let replayed_through = state.revision;
        drop(state);

        Ok(spawn_watch_stream(
            history,
            live,
            prefix.to_string(),
            replayed_through,
            self.watch_buffer_size,
        ))
    }

    fn current_revision(&self) -> u64 {
        self.state.lock().revision
    }

    async fn compact(
        &self,
        revision: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if revision > state.revision {
            return Err(StorageError::invalid(
                "compact",
                format!(
                    "required revision {} is a future revision (current {})",
                    revision, state.revision
                ),
            )
            .into());
        }
        if revision <= state.compacted_revision {
            return Ok(());
        }

        while state.history.front().is_some_and(|e| e.revision <= revision) {
            state.history.pop_front();
        }
        state.compacted_revision = revision;
        debug!(revision, retained = state.history.len(), "compacted memory history");
        Ok(())
    }

    async fn expire(
        &self,
        now_ms: u64,
    ) -> Result<Vec<String>> {
        let candidates: Vec<(String, u64)> = {
            let state = self.state.lock();
            state
                .data
                .values()
                .filter(|kv| kv.expires_at.is_some_and(|deadline| deadline <= now_ms))
                .map(|kv| (kv.key.clone(), kv.mod_revision))
                .collect()
        };

        let mut expired = Vec::with_capacity(candidates.len());
        for (key, mod_revision) in candidates {
            // A concurrent rewrite resets the deadline; leave it alone
            if let TxnOutcome::Succeeded { .. } = self.compare_and_delete(&key, mod_revision).await? {
                expired.push(key);
            }
        }
        Ok(expired)
    }
}
