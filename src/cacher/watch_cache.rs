//! Bounded window of recent change events plus the current state they lead
//! to.
//!
//! The window is a ring of `capacity` entries ordered by resource version.
//! Appending to a full ring evicts the oldest entry, after which watches that
//! would need it fail with `TooOld` and must relist. `replace` resets the ring
//! to a single marker recording the listed version, so a watch resuming
//! exactly from that version gets no events instead of an error.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::AttrFunc;
use crate::EventType;
use crate::Fields;
use crate::KeyFunc;
use crate::Labels;
use crate::Object;
use crate::Result;
use crate::StorageError;
use crate::StorageMetrics;
use crate::Versioner;

/// Current state of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreElement<T> {
    pub key: String,
    pub object: T,
    pub labels: Labels,
    pub fields: Fields,
}

/// One change as recorded by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchCacheEvent<T> {
    pub event_type: EventType,
    pub object: T,
    /// Last observed state, for `MODIFIED` and `DELETED` events
    pub prev_object: Option<T>,
    pub key: String,
    pub resource_version: u64,
    pub labels: Labels,
    pub fields: Fields,
    pub prev_labels: Labels,
    pub prev_fields: Fields,
}

/// Values an object is indexed under.
pub type IndexFunc<T> = Arc<dyn Fn(&T) -> Result<Vec<String>> + Send + Sync>;

pub type Indexers<T> = HashMap<String, IndexFunc<T>>;

/// Selects the objects an index maps `value` to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchValue {
    pub index_name: String,
    pub value: String,
}

/// Invoked with every change once the cache lock is released.
pub type EventHandler<T> = Arc<dyn Fn(Arc<WatchCacheEvent<T>>) + Send + Sync>;

#[derive(Debug)]
enum BufferEntry<T> {
    Event(Arc<WatchCacheEvent<T>>),
    /// Version of a full relist; carries no object
    Marker(u64),
}

impl<T> BufferEntry<T> {
    fn resource_version(&self) -> u64 {
        match self {
            BufferEntry::Event(event) => event.resource_version,
            BufferEntry::Marker(rv) => *rv,
        }
    }
}

struct CacheState<T> {
    buffer: VecDeque<BufferEntry<T>>,
    store: BTreeMap<String, StoreElement<T>>,
    /// index name -> indexed value -> keys
    indices: HashMap<String, HashMap<String, BTreeSet<String>>>,
    resource_version: u64,
    initialized: bool,
}

pub struct WatchCache<T: Object> {
    state: Mutex<CacheState<T>>,
    capacity: usize,
    key_func: KeyFunc<T>,
    attr_func: AttrFunc<T>,
    versioner: Arc<dyn Versioner>,
    indexers: Indexers<T>,
    block_timeout: Duration,
    fresh: watch::Sender<u64>,
    event_handler: RwLock<Option<EventHandler<T>>>,
    metrics: Option<Arc<StorageMetrics>>,
    resource: String,
}

impl<T: Object> WatchCache<T> {
    pub fn new(
        capacity: usize,
        key_func: KeyFunc<T>,
        attr_func: AttrFunc<T>,
        versioner: Arc<dyn Versioner>,
        block_timeout: Duration,
    ) -> Self {
        let (fresh, _) = watch::channel(0);
        Self {
            state: Mutex::new(CacheState {
                buffer: VecDeque::with_capacity(capacity),
                store: BTreeMap::new(),
                indices: HashMap::new(),
                resource_version: 0,
                initialized: false,
            }),
            capacity: capacity.max(1),
            key_func,
            attr_func,
            versioner,
            indexers: Indexers::new(),
            block_timeout,
            fresh,
            event_handler: RwLock::new(None),
            metrics: None,
            resource: String::new(),
        }
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
        resource: impl Into<String>,
    ) -> Self {
        self.metrics = Some(metrics);
        self.resource = resource.into();
        self
    }

    pub fn set_event_handler(
        &self,
        handler: EventHandler<T>,
    ) {
        *self.event_handler.write() = Some(handler);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resource_version(&self) -> u64 {
        self.state.lock().resource_version
    }

    /// True once the first `replace` has landed.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    // ============== Mutations ============== //

    pub fn add(
        &self,
        obj: T,
    ) -> Result<()> {
        self.process_event(EventType::Added, obj)
    }

    pub fn update(
        &self,
        obj: T,
    ) -> Result<()> {
        self.process_event(EventType::Modified, obj)
    }

    pub fn delete(
        &self,
        obj: T,
    ) -> Result<()> {
        self.process_event(EventType::Deleted, obj)
    }

    fn process_event(
        &self,
        event_type: EventType,
        obj: T,
    ) -> Result<()> {
        let key = (self.key_func)(&obj)?;
        let resource_version = self.versioner.object_resource_version(obj.meta())?;
        let (labels, fields) = (self.attr_func)(&obj)?;
        let index_values = self.index_values(&obj)?;

        let event = {
            let mut state = self.state.lock();
            if resource_version <= state.resource_version {
                return Err(StorageError::invalid(
                    &key,
                    format!(
                        "resource version {} is not newer than the cache's {}",
                        resource_version, state.resource_version
                    ),
                )
                .into());
            }

            let prev = state.store.get(&key).cloned();
            let event_type = match (event_type, &prev) {
                (EventType::Added, Some(_)) => EventType::Modified,
                (EventType::Modified, None) => EventType::Added,
                (EventType::Deleted, None) => {
                    trace!(key = %key, resource_version, "delete of unknown key");
                    state.resource_version = resource_version;
                    self.fresh.send_replace(resource_version);
                    return Ok(());
                }
                (event_type, _) => event_type,
            };

            let (prev_object, prev_labels, prev_fields) = match prev {
                Some(prev) => (Some(prev.object), prev.labels, prev.fields),
                None => (None, Labels::new(), Fields::new()),
            };
            let event = Arc::new(WatchCacheEvent {
                event_type,
                object: obj.clone(),
                prev_object,
                key: key.clone(),
                resource_version,
                labels: labels.clone(),
                fields: fields.clone(),
                prev_labels,
                prev_fields,
            });

            self.append(&mut state, BufferEntry::Event(event.clone()));
            Self::unindex(&mut state, &key);
            if event_type == EventType::Deleted {
                state.store.remove(&key);
            } else {
                Self::index(&mut state, &key, index_values);
                state.store.insert(
                    key.clone(),
                    StoreElement {
                        key,
                        object: obj,
                        labels,
                        fields,
                    },
                );
            }
            state.resource_version = resource_version;
            self.fresh.send_replace(resource_version);
            event
        };

        if let Some(metrics) = &self.metrics {
            let type_label = event.event_type.to_string();
            metrics
                .watch_cache_events
                .with_label_values(&[self.resource.as_str(), type_label.as_str()])
                .inc();
            metrics
                .watch_cache_resource_version
                .with_label_values(&[self.resource.as_str()])
                .set(resource_version as i64);
        }
        self.notify(event);
        Ok(())
    }

    /// Resets the cache to `objs` listed at `resource_version`.
    pub fn replace(
        &self,
        objs: Vec<T>,
        resource_version: u64,
    ) -> Result<()> {
        let mut store = BTreeMap::new();
        let mut indexed = Vec::with_capacity(objs.len());
        for obj in objs {
            let key = (self.key_func)(&obj)?;
            let (labels, fields) = (self.attr_func)(&obj)?;
            indexed.push((key.clone(), self.index_values(&obj)?));
            store.insert(
                key.clone(),
                StoreElement {
                    key,
                    object: obj,
                    labels,
                    fields,
                },
            );
        }

        {
            let mut state = self.state.lock();
            state.buffer.clear();
            state.buffer.push_back(BufferEntry::Marker(resource_version));
            state.store = store;
            state.indices.clear();
            for (key, values) in indexed {
                Self::index(&mut state, &key, values);
            }
            state.resource_version = resource_version;
            state.initialized = true;
            self.fresh.send_replace(resource_version);
            debug!(
                resource = %self.resource,
                resource_version,
                objects = state.store.len(),
                "watch cache replaced"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.watch_cache_replaces.with_label_values(&[self.resource.as_str()]).inc();
            metrics
                .watch_cache_resource_version
                .with_label_values(&[self.resource.as_str()])
                .set(resource_version as i64);
        }
        Ok(())
    }

    /// Advances the version without a change, e.g. on a bookmark from
    /// storage. Watchers that asked for bookmarks are told.
    pub fn update_resource_version(
        &self,
        resource_version: u64,
    ) {
        {
            let mut state = self.state.lock();
            if resource_version <= state.resource_version {
                return;
            }
            state.resource_version = resource_version;
            self.fresh.send_replace(resource_version);
        }
        self.notify(Arc::new(self.bookmark_event(resource_version)));
    }

    /// Bookmark event carrying only `resource_version`.
    pub fn bookmark_event(
        &self,
        resource_version: u64,
    ) -> WatchCacheEvent<T> {
        let mut object = T::default();
        self.versioner.update_object(object.meta_mut(), resource_version);
        WatchCacheEvent {
            event_type: EventType::Bookmark,
            object,
            prev_object: None,
            key: String::new(),
            resource_version,
            labels: Labels::new(),
            fields: Fields::new(),
            prev_labels: Labels::new(),
            prev_fields: Fields::new(),
        }
    }

    // ============== Reads ============== //

    pub fn get(
        &self,
        obj: &T,
    ) -> Result<Option<StoreElement<T>>> {
        let key = (self.key_func)(obj)?;
        Ok(self.get_by_key(&key))
    }

    pub fn get_by_key(
        &self,
        key: &str,
    ) -> Option<StoreElement<T>> {
        self.state.lock().store.get(key).cloned()
    }

    /// Every element, sorted by key.
    pub fn list(&self) -> Vec<StoreElement<T>> {
        self.state.lock().store.values().cloned().collect()
    }

    /// Every buffered event newer than `resource_version`, oldest first.
    pub fn get_all_events_since(
        &self,
        resource_version: u64,
    ) -> Result<Vec<Arc<WatchCacheEvent<T>>>> {
        self.with_events_since(resource_version, |events, _| events)
    }

    /// Runs `f` on the events newer than `resource_version` and the cache's
    /// version, under the cache lock. Nothing is appended while `f` runs.
    pub fn with_events_since<R>(
        &self,
        resource_version: u64,
        f: impl FnOnce(Vec<Arc<WatchCacheEvent<T>>>, u64) -> R,
    ) -> Result<R> {
        let state = self.state.lock();
        let events = self.events_since(&state, resource_version)?;
        Ok(f(events, state.resource_version))
    }

    /// Runs `f` on the current elements and the cache's version, under the
    /// cache lock.
    pub fn with_snapshot<R>(
        &self,
        f: impl FnOnce(Vec<StoreElement<T>>, u64) -> R,
    ) -> Result<R> {
        let state = self.state.lock();
        if !state.initialized {
            return Err(StorageError::Unavailable("watch cache is not initialized".into()).into());
        }
        let elements = state.store.values().cloned().collect();
        Ok(f(elements, state.resource_version))
    }

    fn events_since(
        &self,
        state: &CacheState<T>,
        resource_version: u64,
    ) -> Result<Vec<Arc<WatchCacheEvent<T>>>> {
        if !state.initialized {
            return Err(StorageError::Unavailable("watch cache is not initialized".into()).into());
        }

        // A marker at the front means nothing was evicted since the relist
        let oldest = match state.buffer.front() {
            Some(BufferEntry::Marker(rv)) => rv.saturating_add(1),
            Some(BufferEntry::Event(event)) => event.resource_version,
            None => state.resource_version.saturating_add(1),
        };
        if resource_version.saturating_add(1) < oldest {
            if let Some(metrics) = &self.metrics {
                metrics.watch_cache_too_old.with_label_values(&[self.resource.as_str()]).inc();
            }
            return Err(StorageError::TooOld {
                requested: resource_version,
                oldest,
            }
            .into());
        }

        let first = state.buffer.partition_point(|entry| entry.resource_version() <= resource_version);
        Ok(state
            .buffer
            .range(first..)
            .filter_map(|entry| match entry {
                BufferEntry::Event(event) => Some(event.clone()),
                BufferEntry::Marker(_) => None,
            })
            .collect())
    }

    /// Blocks until the cache has seen `resource_version`, bounded by the
    /// block timeout.
    pub async fn wait_until_fresh(
        &self,
        resource_version: u64,
    ) -> Result<u64> {
        let mut rx = self.fresh.subscribe();
        let waited = timeout(self.block_timeout, rx.wait_for(|current| *current >= resource_version))
            .await
            .map(|seen| seen.map(|current| *current));
        match waited {
            Ok(Ok(current)) => Ok(current),
            Ok(Err(_)) => Err(StorageError::Unavailable("watch cache closed".into()).into()),
            Err(_) => {
                let current = *self.fresh.borrow();
                warn!(
                    resource = %self.resource,
                    requested = resource_version,
                    current,
                    "timed out waiting for watch cache to catch up"
                );
                if let Some(metrics) = &self.metrics {
                    metrics
                        .watch_cache_fresh_timeouts
                        .with_label_values(&[self.resource.as_str()])
                        .inc();
                }
                Err(StorageError::Timeout {
                    requested: resource_version,
                    current,
                }
                .into())
            }
        }
    }

    /// Elements once the cache has seen `resource_version`, narrowed by the
    /// first match value naming a registered index.
    pub async fn wait_until_fresh_and_list(
        &self,
        resource_version: u64,
        match_values: &[MatchValue],
    ) -> Result<(Vec<StoreElement<T>>, u64)> {
        self.wait_until_fresh(resource_version).await?;

        let state = self.state.lock();
        let indexed: Option<Vec<StoreElement<T>>> = match_values
            .iter()
            .find(|m| self.indexers.contains_key(&m.index_name))
            .map(|m| {
                state
                    .indices
                    .get(&m.index_name)
                    .and_then(|index| index.get(&m.value))
                    .map(|keys| keys.iter().filter_map(|key| state.store.get(key).cloned()).collect())
                    .unwrap_or_default()
            });
        let elements = indexed.unwrap_or_else(|| state.store.values().cloned().collect());
        Ok((elements, state.resource_version))
    }

    pub async fn wait_until_fresh_and_get(
        &self,
        resource_version: u64,
        key: &str,
    ) -> Result<(Option<StoreElement<T>>, u64)> {
        self.wait_until_fresh(resource_version).await?;

        let state = self.state.lock();
        Ok((state.store.get(key).cloned(), state.resource_version))
    }

    // ============== Internals ============== //

    fn append(
        &self,
        state: &mut CacheState<T>,
        entry: BufferEntry<T>,
    ) {
        if state.buffer.len() >= self.capacity {
            state.buffer.pop_front();
            if let Some(metrics) = &self.metrics {
                metrics.watch_cache_evictions.with_label_values(&[self.resource.as_str()]).inc();
            }
        }
        state.buffer.push_back(entry);
    }

    fn index_values(
        &self,
        obj: &T,
    ) -> Result<Vec<(String, Vec<String>)>> {
        self.indexers
            .iter()
            .map(|(name, func)| Ok((name.clone(), func(obj)?)))
            .collect()
    }

    fn index(
        state: &mut CacheState<T>,
        key: &str,
        values: Vec<(String, Vec<String>)>,
    ) {
        for (name, values) in values {
            let index = state.indices.entry(name).or_default();
            for value in values {
                index.entry(value).or_default().insert(key.to_string());
            }
        }
    }

    fn unindex(
        state: &mut CacheState<T>,
        key: &str,
    ) {
        for index in state.indices.values_mut() {
            index.retain(|_, keys| {
                keys.remove(key);
                !keys.is_empty()
            });
        }
    }

    fn notify(
        &self,
        event: Arc<WatchCacheEvent<T>>,
    ) {
        let handler = self.event_handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}
