//! Keeps a [`WatchCache`] in sync with the underlying storage.
//!
//! One loop per cacher: list everything, `replace` the cache with it, then
//! apply the watch stream opened at the listed version. When the stream
//! breaks the loop backs off and starts over with a fresh list.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::dispatcher::WatcherRegistry;
use crate::utils::async_task::with_timeout;
use crate::utils::async_task::Backoff;
use crate::BackoffPolicy;
use crate::Interface;
use crate::ListOptions;
use crate::Object;
use crate::Result;
use crate::StorageError;
use crate::WatchCache;
use crate::WatchEvent;
use crate::Watcher;

pub(crate) struct Reflector<T: Object> {
    pub(crate) storage: Arc<dyn Interface<T>>,
    pub(crate) cache: Arc<WatchCache<T>>,
    pub(crate) registry: Arc<WatcherRegistry<T>>,
    pub(crate) resource_prefix: String,
    pub(crate) relist_policy: BackoffPolicy,
    /// Flipped to true once the first list has landed in the cache
    pub(crate) ready: watch::Sender<bool>,
}

impl<T: Object> Reflector<T> {
    pub(crate) async fn run(
        self,
        token: CancellationToken,
    ) -> Result<()> {
        let mut backoff = Backoff::new(self.relist_policy);
        let mut synced = false;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                outcome = self.list_and_watch(&mut synced, &mut backoff) => outcome,
            };
            match outcome {
                Ok(()) => debug!(prefix = %self.resource_prefix, "storage watch closed, relisting"),
                Err(e) => warn!(prefix = %self.resource_prefix, "reflector cycle failed: {:?}", e),
            }

            let Some(delay) = backoff.next_delay() else {
                self.registry.terminate_all();
                return Err(StorageError::Unavailable(format!(
                    "giving up syncing {} after {} attempts",
                    self.resource_prefix,
                    backoff.attempts()
                ))
                .into());
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        debug!(prefix = %self.resource_prefix, "reflector stopped");
        self.registry.terminate_all();
        Ok(())
    }

    async fn list_and_watch(
        &self,
        synced: &mut bool,
        backoff: &mut Backoff,
    ) -> Result<()> {
        let versioner = self.storage.versioner();
        let opts = ListOptions {
            recursive: true,
            ..Default::default()
        };
        let list = with_timeout(
            backoff.op_timeout(),
            "relist",
            self.storage.list(&self.resource_prefix, opts),
        )
        .await?;
        let resource_version = versioner.parse_resource_version(&list.metadata.resource_version)?;
        let count = list.items.len();

        self.cache.replace(list.items, resource_version)?;
        if *synced {
            // Registered watchers may have missed changes folded into the relist
            self.registry.terminate_all();
        }
        *synced = true;
        self.ready.send_replace(true);
        backoff.reset();
        info!(
            prefix = %self.resource_prefix,
            resource_version,
            objects = count,
            "watch cache synced"
        );

        let mut watcher = self
            .storage
            .watch(
                &self.resource_prefix,
                ListOptions {
                    resource_version: resource_version.to_string(),
                    recursive: true,
                    allow_watch_bookmarks: true,
                    ..Default::default()
                },
            )
            .await?;

        while let Some(event) = watcher.recv().await {
            match event {
                WatchEvent::Added(obj) => self.cache.add(obj)?,
                WatchEvent::Modified(obj) => self.cache.update(obj)?,
                WatchEvent::Deleted(obj) => self.cache.delete(obj)?,
                WatchEvent::Bookmark(obj) => {
                    let resource_version = versioner.object_resource_version(obj.meta())?;
                    self.cache.update_resource_version(resource_version);
                }
                WatchEvent::Error(status) => {
                    return Err(StorageError::Unavailable(format!(
                        "watch of {} failed: {} ({})",
                        self.resource_prefix, status.message, status.code
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}
