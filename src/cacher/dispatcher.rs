//! Fan-out of watch cache events to registered cache watchers.
//!
//! ```text
//! reflector -> WatchCache::add/update/delete -> event handler
//!                                                   ↓
//!                          WatcherRegistry::dispatch -> try_send(per-watcher queue)
//!                                                   ↓
//!                                     watcher task -> WatchSender -> consumer
//! ```
//!
//! Dispatch never blocks the reflector. A watcher whose queue is full cannot
//! be delivered a gap-free stream any more, so its input is dropped: the
//! consumer reads what was already queued, sees the watch close, and resumes
//! through a new watch.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::EventType;
use crate::StorageMetrics;
use crate::WatchCacheEvent;

/// Registry side of one cache watcher.
#[derive(Debug)]
pub(crate) struct CacheWatcher<T> {
    pub(crate) input: mpsc::Sender<Arc<WatchCacheEvent<T>>>,
    /// Cancelling closes the consumer's handle at once, discarding
    /// anything still queued
    pub(crate) token: CancellationToken,
    pub(crate) allow_bookmarks: bool,
}

pub(crate) struct WatcherRegistry<T> {
    watchers: DashMap<u64, CacheWatcher<T>>,
    next_id: AtomicU64,
    metrics: Option<Arc<StorageMetrics>>,
    resource: String,
}

impl<T> std::fmt::Debug for WatcherRegistry<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatcherRegistry")
            .field("watchers", &self.watchers.len())
            .field("next_id", &self.next_id)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> WatcherRegistry<T> {
    pub(crate) fn new(
        metrics: Option<Arc<StorageMetrics>>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            watchers: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics,
            resource: resource.into(),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(
        &self,
        id: u64,
        watcher: CacheWatcher<T>,
    ) {
        self.watchers.insert(id, watcher);
        trace!(watcher_id = id, resource = %self.resource, "cache watcher registered");
        self.update_active_gauge();
    }

    pub(crate) fn unregister(
        &self,
        id: u64,
    ) {
        if self.watchers.remove(&id).is_some() {
            trace!(watcher_id = id, resource = %self.resource, "cache watcher unregistered");
            self.update_active_gauge();
        }
    }

    /// Offers `event` to every watcher without waiting. Bookmarks only go to
    /// watchers that asked for them.
    pub(crate) fn dispatch(
        &self,
        event: Arc<WatchCacheEvent<T>>,
    ) {
        let is_bookmark = event.event_type == EventType::Bookmark;
        let mut overflowed = Vec::new();
        let mut closed = Vec::new();

        for entry in self.watchers.iter() {
            let watcher = entry.value();
            if is_bookmark && !watcher.allow_bookmarks {
                continue;
            }
            match watcher.input.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => overflowed.push(*entry.key()),
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        trace!(
            resource = %self.resource,
            resource_version = event.resource_version,
            event_type = %event.event_type,
            watchers = self.watchers.len(),
            "event dispatched"
        );

        // Shard locks are released; safe to mutate now
        for id in overflowed {
            if let Some((_, watcher)) = self.watchers.remove(&id) {
                warn!(
                    watcher_id = id,
                    resource = %self.resource,
                    "terminating cache watcher that cannot keep up"
                );
                // Dropping the input closes it once drained, so the consumer
                // still reads what was queued before the stream ends
                drop(watcher);
                if let Some(metrics) = &self.metrics {
                    metrics
                        .watchers_terminated
                        .with_label_values(&[self.resource.as_str()])
                        .inc();
                }
            }
        }
        for id in closed {
            self.watchers.remove(&id);
        }
        self.update_active_gauge();
    }

    /// Closes every registered watcher, e.g. after the cache was relisted.
    pub(crate) fn terminate_all(&self) {
        let ids: Vec<u64> = self.watchers.iter().map(|entry| *entry.key()).collect();
        if ids.is_empty() {
            return;
        }
        debug!(resource = %self.resource, watchers = ids.len(), "terminating all cache watchers");
        for id in ids {
            if let Some((_, watcher)) = self.watchers.remove(&id) {
                watcher.token.cancel();
            }
        }
        self.update_active_gauge();
    }

    pub(crate) fn len(&self) -> usize {
        self.watchers.len()
    }

    fn update_active_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics
                .watchers_active
                .with_label_values(&[self.resource.as_str()])
                .set(self.watchers.len() as i64);
        }
    }
}
