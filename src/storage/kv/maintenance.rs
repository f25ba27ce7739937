//! Background upkeep of a [`KvBackend`]: TTL expiry and history compaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::KvBackend;
use crate::utils::time::now_ms;
use crate::ApiStoreConfig;

/// Spawns the TTL expiry worker.
///
/// Every `interval_ms` it deletes keys whose deadline has passed. Deletions
/// go through the backend's normal write path, so watchers see them as
/// ordinary deletes.
pub fn spawn_expiry_worker(
    backend: Arc<dyn KvBackend>,
    interval_ms: u64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match backend.expire(now_ms()).await {
                        Ok(deleted_keys) => {
                            if !deleted_keys.is_empty() {
                                debug!("Lease expiry: deleted {} expired keys", deleted_keys.len());
                            }
                        }
                        Err(e) => {
                            error!("Lease expiry failed: {:?}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Lease expiry worker received shutdown signal");
                    break;
                }
            }
        }

        debug!("Lease expiry worker stopped");
    })
}

/// Spawns the history compaction worker.
///
/// Each tick compacts up to the revision observed on the previous tick, so
/// watchers always get at least one interval to catch up before the history
/// they need is dropped.
pub fn spawn_compaction_worker(
    backend: Arc<dyn KvBackend>,
    interval_ms: u64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        let mut previous_revision = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if previous_revision > 0 {
                        match backend.compact(previous_revision).await {
                            Ok(()) => debug!(revision = previous_revision, "compacted kv history"),
                            Err(e) => error!("Compaction to {} failed: {:?}", previous_revision, e),
                        }
                    }
                    previous_revision = backend.current_revision();
                }
                _ = shutdown.cancelled() => {
                    info!("Compaction worker received shutdown signal");
                    break;
                }
            }
        }

        debug!("Compaction worker stopped");
    })
}

/// Starts the workers enabled by `config`: expiry when `lease.enabled`,
/// compaction unless `storage.compaction_interval_ms` is 0.
pub fn spawn_maintenance(
    backend: Arc<dyn KvBackend>,
    config: &ApiStoreConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut workers = Vec::new();
    if config.lease.enabled {
        workers.push(spawn_expiry_worker(
            backend.clone(),
            config.lease.interval_ms,
            shutdown.clone(),
        ));
    }
    if config.storage.compaction_interval_ms > 0 {
        workers.push(spawn_compaction_worker(
            backend,
            config.storage.compaction_interval_ms,
            shutdown,
        ));
    }
    info!(workers = workers.len(), "kv maintenance started");
    workers
}
