use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::dispatcher::CacheWatcher;
use super::dispatcher::WatcherRegistry;
use super::reflector::Reflector;
use crate::default_attr_func;
use crate::namespace_key_func;
use crate::utils::async_task::spawn_task;
use crate::watch_channel;
use crate::ApiStoreConfig;
use crate::AttrFunc;
use crate::BackoffPolicy;
use crate::EventType;
use crate::GetOptions;
use crate::Indexers;
use crate::Interface;
use crate::KeyFunc;
use crate::ListOptions;
use crate::MatchValue;
use crate::Object;
use crate::ObjectList;
use crate::Operator;
use crate::Preconditions;
use crate::ResourceVersionMatch;
use crate::Result;
use crate::SelectionPredicate;
use crate::StorageError;
use crate::StorageMetrics;
use crate::UpdateFunc;
use crate::ValidateDeletionFunc;
use crate::Versioner;
use crate::WatchCache;
use crate::WatchCacheConfig;
use crate::WatchCacheEvent;
use crate::WatchEvent;
use crate::WatchFilter;
use crate::WatchHandle;
use crate::WatchSender;

/// Construction parameters of a [`Cacher`].
pub struct CacherConfig<T: Object> {
    /// Key prefix of the cached resource, e.g. `/pods`
    pub resource_prefix: String,
    pub key_func: KeyFunc<T>,
    pub attr_func: AttrFunc<T>,
    /// Secondary indexes, named after the label or field they index
    pub indexers: Indexers<T>,
    pub watch_cache: WatchCacheConfig,
    pub relist: BackoffPolicy,
    pub metrics: Option<Arc<StorageMetrics>>,
}

impl<T: Object> CacherConfig<T> {
    /// Namespaced keys under `resource_prefix` with default settings.
    pub fn new(resource_prefix: impl Into<String>) -> Self {
        let resource_prefix = resource_prefix.into();
        Self {
            key_func: namespace_key_func(resource_prefix.clone()),
            attr_func: default_attr_func(),
            indexers: Indexers::new(),
            watch_cache: WatchCacheConfig::default(),
            relist: ApiStoreConfig::default().retry.relist,
            metrics: None,
            resource_prefix,
        }
    }

    pub fn with_config(
        mut self,
        config: &ApiStoreConfig,
    ) -> Self {
        self.watch_cache = config.watch_cache.clone();
        self.relist = config.retry.relist;
        self
    }

    pub fn with_key_func(
        mut self,
        key_func: KeyFunc<T>,
    ) -> Self {
        self.key_func = key_func;
        self
    }

    pub fn with_attr_func(
        mut self,
        attr_func: AttrFunc<T>,
    ) -> Self {
        self.attr_func = attr_func;
        self
    }

    pub fn with_indexers(
        mut self,
        indexers: Indexers<T>,
    ) -> Self {
        self.indexers = indexers;
        self
    }

    pub fn with_metrics(
        mut self,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// [`Interface`] that serves reads and watches from a [`WatchCache`] kept in
/// sync with an underlying storage, and passes writes through to it.
///
/// Must be created inside a tokio runtime: construction spawns the reflector
/// and the bookmark timer.
pub struct Cacher<T: Object> {
    storage: Arc<dyn Interface<T>>,
    cache: Arc<WatchCache<T>>,
    registry: Arc<WatcherRegistry<T>>,
    versioner: Arc<dyn Versioner>,
    resource_prefix: String,
    resource: String,
    block_timeout: Duration,
    watcher_buffer_size: usize,
    ready: watch::Receiver<bool>,
    token: CancellationToken,
    metrics: Option<Arc<StorageMetrics>>,
}

impl<T: Object> std::fmt::Debug for Cacher<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Cacher")
            .field("resource_prefix", &self.resource_prefix)
            .field("watchers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<T: Object> Cacher<T> {
    pub fn new(
        storage: Arc<dyn Interface<T>>,
        config: CacherConfig<T>,
    ) -> Self {
        let versioner = storage.versioner();
        let resource = config.resource_prefix.trim_matches('/').to_string();
        let block_timeout = Duration::from_millis(config.watch_cache.block_timeout_ms);

        let mut cache = WatchCache::new(
            config.watch_cache.capacity,
            config.key_func,
            config.attr_func,
            versioner.clone(),
            block_timeout,
        )
        .with_indexers(config.indexers);
        if let Some(metrics) = &config.metrics {
            cache = cache.with_metrics(metrics.clone(), resource.clone());
        }
        let cache = Arc::new(cache);

        let registry = Arc::new(WatcherRegistry::new(config.metrics.clone(), resource.clone()));
        let dispatch_to = registry.clone();
        cache.set_event_handler(Arc::new(move |event| dispatch_to.dispatch(event)));

        let (ready_tx, ready) = watch::channel(false);
        let token = CancellationToken::new();

        let reflector = Reflector {
            storage: storage.clone(),
            cache: cache.clone(),
            registry: registry.clone(),
            resource_prefix: config.resource_prefix.clone(),
            relist_policy: config.relist,
            ready: ready_tx,
        };
        let reflector_token = token.clone();
        spawn_task("reflector", move || reflector.run(reflector_token));

        let bookmark_cache = cache.clone();
        let bookmark_registry = registry.clone();
        let bookmark_token = token.clone();
        let bookmark_interval = Duration::from_millis(config.watch_cache.bookmark_interval_ms);
        spawn_task("bookmarks", move || {
            run_bookmarks(bookmark_cache, bookmark_registry, bookmark_interval, bookmark_token)
        });

        debug!(prefix = %config.resource_prefix, "cacher started");
        Self {
            storage,
            cache,
            registry,
            versioner,
            resource_prefix: config.resource_prefix,
            resource,
            block_timeout,
            watcher_buffer_size: config.watch_cache.watcher_buffer_size,
            ready,
            token,
            metrics: config.metrics,
        }
    }

    /// True once the cache holds a full list.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn watch_cache(&self) -> &Arc<WatchCache<T>> {
        &self.cache
    }

    pub fn watcher_count(&self) -> usize {
        self.registry.len()
    }

    /// Stops the reflector and closes every watcher. Idempotent.
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            debug!(prefix = %self.resource_prefix, "stopping cacher");
        }
        self.token.cancel();
        self.registry.terminate_all();
    }

    async fn wait_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let mut ready = self.ready.clone();
        let waited = timeout(self.block_timeout, ready.wait_for(|ready| *ready))
            .await
            .map(|seen| seen.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            _ => Err(StorageError::Unavailable(format!(
                "cache for {} is not ready",
                self.resource_prefix
            ))
            .into()),
        }
    }

    fn parse_resource_version(
        &self,
        resource_version: &str,
    ) -> Result<u64> {
        self.versioner.parse_resource_version(resource_version)
    }

    fn cached_object(
        &self,
        key: &str,
    ) -> Option<T> {
        self.cache.get_by_key(key).map(|element| element.object)
    }
}

impl<T: Object> Drop for Cacher<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Index lookups implied by a predicate: every `key=value` requirement of the
/// field selector, then of the label selector.
fn match_values(predicate: &SelectionPredicate) -> Vec<MatchValue> {
    predicate
        .field
        .requirements()
        .iter()
        .chain(predicate.label.requirements())
        .filter(|requirement| requirement.operator == Operator::Equals)
        .map(|requirement| MatchValue {
            index_name: requirement.key.clone(),
            value: requirement.value.clone(),
        })
        .collect()
}

fn is_paginated(predicate: &SelectionPredicate) -> bool {
    predicate.has_limit() || !predicate.continue_token.is_empty()
}

#[async_trait]
impl<T: Object> Interface<T> for Cacher<T> {
    fn versioner(&self) -> Arc<dyn Versioner> {
        self.versioner.clone()
    }

    async fn create(
        &self,
        key: &str,
        obj: T,
        ttl: Option<u64>,
    ) -> Result<T> {
        self.storage.create(key, obj, ttl).await
    }

    async fn delete<'a>(
        &self,
        key: &str,
        preconditions: Option<&'a Preconditions>,
        validate_deletion: Option<ValidateDeletionFunc<'a, T>>,
        cached_existing: Option<T>,
    ) -> Result<T> {
        let suggestion = cached_existing.or_else(|| self.cached_object(key));
        self.storage
            .delete(key, preconditions, validate_deletion, suggestion)
            .await
    }

    async fn watch(
        &self,
        key: &str,
        opts: ListOptions,
    ) -> Result<WatchHandle<T>> {
        let resource_version = self.parse_resource_version(&opts.resource_version)?;
        self.wait_ready().await?;
        if resource_version > self.cache.resource_version() {
            self.cache.wait_until_fresh(resource_version).await?;
        }

        let filter = WatchFilter::new(key, opts.recursive, opts.predicate);
        let (sender, handle) = watch_channel(self.watcher_buffer_size);
        let (input, input_rx) = mpsc::channel(self.watcher_buffer_size.max(1));
        let id = self.registry.next_id();
        let watcher = CacheWatcher {
            input,
            token: sender.token().clone(),
            allow_bookmarks: opts.allow_watch_bookmarks,
        };

        // Registration happens under the cache lock, so no event falls
        // between the initial batch and the first dispatched one
        let registry = &self.registry;
        let versioner = self.versioner.as_ref();
        let (initial, start_rv): (Vec<WatchEvent<T>>, u64) = if resource_version == 0 {
            self.cache.with_snapshot(|elements, cache_rv| {
                registry.register(id, watcher);
                let initial = elements
                    .into_iter()
                    .filter(|e| filter.matches_key(&e.key) && filter.predicate().matches(&e.labels, &e.fields))
                    .map(|e| WatchEvent::Added(e.object))
                    .collect();
                (initial, cache_rv)
            })?
        } else {
            self.cache.with_events_since(resource_version, |events, cache_rv| {
                registry.register(id, watcher);
                let initial = events
                    .iter()
                    .filter_map(|event| filter.convert(event, versioner))
                    .collect();
                (initial, cache_rv)
            })?
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .watch_init_events
                .with_label_values(&[self.resource.as_str()])
                .inc_by(initial.len() as u64);
        }
        debug!(
            watcher_id = id,
            key = %key,
            resource_version,
            start_rv,
            initial = initial.len(),
            "cache watcher started"
        );

        let task = CacheWatcherTask {
            id,
            registry: self.registry.clone(),
            filter,
            versioner: self.versioner.clone(),
            start_rv,
        };
        tokio::spawn(task.run(initial, input_rx, sender));
        Ok(handle)
    }

    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
    ) -> Result<T> {
        if opts.resource_version.is_empty() {
            return self.storage.get(key, opts).await;
        }
        let resource_version = self.parse_resource_version(&opts.resource_version)?;
        self.wait_ready().await?;

        let (element, _) = self.cache.wait_until_fresh_and_get(resource_version, key).await?;
        match element {
            Some(element) => Ok(element.object),
            None if opts.ignore_not_found => Ok(T::default()),
            None => Err(StorageError::not_found(key).into()),
        }
    }

    async fn get_to_list(
        &self,
        key: &str,
        opts: ListOptions,
    ) -> Result<ObjectList<T>> {
        if opts.resource_version.is_empty() || opts.resource_version_match == ResourceVersionMatch::Exact {
            return self.storage.get_to_list(key, opts).await;
        }
        let resource_version = self.parse_resource_version(&opts.resource_version)?;
        self.wait_ready().await?;

        let (element, cache_rv) = self.cache.wait_until_fresh_and_get(resource_version, key).await?;
        let mut list = ObjectList::default();
        if let Some(element) = element {
            if opts.predicate.matches(&element.labels, &element.fields) {
                list.items.push(element.object);
            }
        }
        self.versioner.update_list(&mut list.metadata, cache_rv, "", None)?;
        Ok(list)
    }

    async fn list(
        &self,
        key: &str,
        opts: ListOptions,
    ) -> Result<ObjectList<T>> {
        if !opts.recursive {
            return self.get_to_list(key, opts).await;
        }
        if opts.resource_version.is_empty()
            || opts.resource_version_match == ResourceVersionMatch::Exact
            || is_paginated(&opts.predicate)
        {
            return self.storage.list(key, opts).await;
        }
        let resource_version = self.parse_resource_version(&opts.resource_version)?;
        self.wait_ready().await?;

        let (elements, cache_rv) = self
            .cache
            .wait_until_fresh_and_list(resource_version, &match_values(&opts.predicate))
            .await?;
        let filter = WatchFilter::new(key, true, opts.predicate);
        let items: Vec<T> = elements
            .into_iter()
            .filter(|e| filter.matches_key(&e.key) && filter.predicate().matches(&e.labels, &e.fields))
            .map(|e| e.object)
            .collect();
        trace!(key = %key, resource_version = cache_rv, items = items.len(), "list served from cache");

        let mut list = ObjectList {
            items,
            ..Default::default()
        };
        self.versioner.update_list(&mut list.metadata, cache_rv, "", None)?;
        Ok(list)
    }

    async fn count(
        &self,
        key: &str,
    ) -> Result<u64> {
        self.storage.count(key).await
    }

    async fn guaranteed_update<'a>(
        &self,
        key: &str,
        ignore_not_found: bool,
        preconditions: Option<&'a Preconditions>,
        try_update: UpdateFunc<'a, T>,
        cached_existing: Option<T>,
    ) -> Result<T> {
        let suggestion = cached_existing.or_else(|| self.cached_object(key));
        self.storage
            .guaranteed_update(key, ignore_not_found, preconditions, try_update, suggestion)
            .await
    }
}

// ============== Per-watcher task ============== //

struct CacheWatcherTask<T> {
    id: u64,
    registry: Arc<WatcherRegistry<T>>,
    filter: WatchFilter,
    versioner: Arc<dyn Versioner>,
    /// Cache version the initial batch was taken at
    start_rv: u64,
}

impl<T: Object> CacheWatcherTask<T> {
    async fn run(
        self,
        initial: Vec<WatchEvent<T>>,
        mut input: mpsc::Receiver<Arc<WatchCacheEvent<T>>>,
        sender: WatchSender<T>,
    ) {
        for event in initial {
            if !sender.send(event).await {
                self.registry.unregister(self.id);
                return;
            }
        }

        let mut last_rv = self.start_rv;
        loop {
            let event = tokio::select! {
                biased;
                _ = sender.cancelled() => break,
                event = input.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            // Already covered by the initial batch, or a bookmark that lost
            // the race with a newer event
            let is_bookmark = event.event_type == EventType::Bookmark;
            if event.resource_version < last_rv || (!is_bookmark && event.resource_version == last_rv) {
                continue;
            }
            last_rv = event.resource_version;

            if let Some(out) = self.filter.convert(&event, self.versioner.as_ref()) {
                if !sender.send(out).await {
                    break;
                }
            }
        }

        trace!(watcher_id = self.id, "cache watcher finished");
        self.registry.unregister(self.id);
    }
}

async fn run_bookmarks<T: Object>(
    cache: Arc<WatchCache<T>>,
    registry: Arc<WatcherRegistry<T>>,
    period: Duration,
    token: CancellationToken,
) -> Result<()> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        if cache.is_initialized() && registry.len() > 0 {
            let event = cache.bookmark_event(cache.resource_version());
            registry.dispatch(Arc::new(event));
        }
    }
}
