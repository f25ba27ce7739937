//! [`Interface`] implementation over a revisioned [`KvBackend`].
//!
//! Objects are encoded by a [`Codec`], passed through a [`Transformer`] (the
//! storage key is the authenticated data) and written under
//! `{path_prefix}{key}`. Backend revisions become resource versions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::default_attr_func;
use crate::decode_continue;
use crate::encode_continue;
use crate::utils::async_task::with_timeout;
use crate::utils::async_task::Backoff;
use crate::utils::time::now_ms;
use crate::utils::time::remaining_ttl_secs;
use crate::watch_channel;
use crate::ApiObjectVersioner;
use crate::ApiStoreConfig;
use crate::AttrFunc;
use crate::BackoffPolicy;
use crate::Codec;
use crate::Context;
use crate::EventType;
use crate::GetOptions;
use crate::IdentityTransformer;
use crate::Interface;
use crate::JsonCodec;
use crate::KeyValue;
use crate::KvBackend;
use crate::KvEvent;
use crate::KvEventType;
use crate::KvWatchStream;
use crate::ListMeta;
use crate::ListOptions;
use crate::Object;
use crate::ObjectList;
use crate::Preconditions;
use crate::ResourceVersionMatch;
use crate::ResponseMeta;
use crate::Result;
use crate::RetryPolicies;
use crate::StorageError;
use crate::StorageMetrics;
use crate::Transformer;
use crate::TxnOutcome;
use crate::UpdateFunc;
use crate::ValidateDeletionFunc;
use crate::Versioner;
use crate::WatchCacheEvent;
use crate::WatchEvent;
use crate::WatchFilter;
use crate::WatchHandle;
use crate::WatchSender;

const DEFAULT_WATCH_BUFFER_SIZE: usize = 100;

/// Bytes to object path shared by the store and its watch tasks.
struct ObjectDecoder<T> {
    codec: Arc<dyn Codec<T>>,
    transformer: Arc<dyn Transformer>,
    versioner: Arc<dyn Versioner>,
    attr_func: AttrFunc<T>,
}

impl<T> Clone for ObjectDecoder<T> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
            transformer: self.transformer.clone(),
            versioner: self.versioner.clone(),
            attr_func: self.attr_func.clone(),
        }
    }
}

impl<T: Object> ObjectDecoder<T> {
    /// Decodes a stored value, stamping its mod revision. Also returns the
    /// plaintext and whether the transformer reported it stale.
    async fn decode(
        &self,
        kv: &KeyValue,
    ) -> Result<(T, Vec<u8>, bool)> {
        let ctx = Context::new(kv.key.as_bytes());
        let (plain, stale) = self.transformer.transform_from_storage(&kv.value, &ctx).await?;
        let mut obj = self.codec.decode(&plain)?;
        self.versioner.update_object(obj.meta_mut(), kv.mod_revision);
        Ok((obj, plain, stale))
    }

    async fn encode(
        &self,
        full_key: &str,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.transformer
            .transform_to_storage(data, &Context::new(full_key.as_bytes()))
            .await
    }

    /// Turns a backend change into a cache-shaped event keyed relative to
    /// `key_root`.
    async fn to_event(
        &self,
        event: &KvEvent,
        key_root: &str,
    ) -> Result<Option<WatchCacheEvent<T>>> {
        let key = event.key().strip_prefix(key_root).unwrap_or(event.key()).to_string();

        let prev = match &event.prev_kv {
            Some(prev_kv) => Some(self.decode(prev_kv).await?.0),
            None => None,
        };
        let (prev_labels, prev_fields) = match &prev {
            Some(prev) => (self.attr_func)(prev)?,
            None => Default::default(),
        };

        let (event_type, object) = match event.event_type {
            KvEventType::Put => {
                let (obj, _, _) = self.decode(&event.kv).await?;
                let event_type = if prev.is_some() {
                    EventType::Modified
                } else {
                    EventType::Added
                };
                (event_type, obj)
            }
            KvEventType::Delete => {
                let Some(mut obj) = prev.clone() else {
                    warn!(key = %key, revision = event.revision, "delete event without previous value");
                    return Ok(None);
                };
                self.versioner.update_object(obj.meta_mut(), event.revision);
                (EventType::Deleted, obj)
            }
        };
        let (labels, fields) = (self.attr_func)(&object)?;

        Ok(Some(WatchCacheEvent {
            event_type,
            object,
            prev_object: prev,
            key,
            resource_version: event.revision,
            labels,
            fields,
            prev_labels,
            prev_fields,
        }))
    }
}

/// Current state of a key as seen by a read-modify-write loop.
struct ObjState<T> {
    obj: T,
    meta: ResponseMeta,
    /// Mod revision the next write is conditioned on; 0 when absent
    rev: u64,
    /// Plaintext as stored, compared against the update to detect no-ops
    data: Vec<u8>,
    stale: bool,
    exists: bool,
}

/// Object storage over a [`KvBackend`].
pub struct KvStore<T: Object> {
    backend: Arc<dyn KvBackend>,
    decoder: ObjectDecoder<T>,
    /// Path prefix without trailing slash; `""` for the root prefix
    key_root: String,
    update_policy: BackoffPolicy,
    watch_buffer_size: usize,
    metrics: Option<Arc<StorageMetrics>>,
    resource: String,
}

impl<T: Object> KvStore<T> {
    /// JSON codec, identity transformer and default attributes under
    /// `/registry`.
    pub fn new(
        backend: Arc<dyn KvBackend>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            decoder: ObjectDecoder {
                codec: Arc::new(JsonCodec::new()),
                transformer: Arc::new(IdentityTransformer),
                versioner: Arc::new(ApiObjectVersioner),
                attr_func: default_attr_func(),
            },
            key_root: "/registry".to_string(),
            update_policy: RetryPolicies::default().guaranteed_update,
            watch_buffer_size: DEFAULT_WATCH_BUFFER_SIZE,
            metrics: None,
            resource: resource.into(),
        }
    }

    pub fn from_config(
        backend: Arc<dyn KvBackend>,
        resource: impl Into<String>,
        config: &ApiStoreConfig,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        Self::new(backend, resource)
            .with_path_prefix(&config.storage.path_prefix)
            .with_update_policy(config.retry.guaranteed_update)
            .with_watch_buffer_size(config.watch_cache.watcher_buffer_size)
            .with_transformer(transformer)
    }

    pub fn with_codec(
        mut self,
        codec: Arc<dyn Codec<T>>,
    ) -> Self {
        self.decoder.codec = codec;
        self
    }

    pub fn with_transformer(
        mut self,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        self.decoder.transformer = transformer;
        self
    }

    pub fn with_versioner(
        mut self,
        versioner: Arc<dyn Versioner>,
    ) -> Self {
        self.decoder.versioner = versioner;
        self
    }

    pub fn with_attr_func(
        mut self,
        attr_func: AttrFunc<T>,
    ) -> Self {
        self.decoder.attr_func = attr_func;
        self
    }

    pub fn with_path_prefix(
        mut self,
        path_prefix: &str,
    ) -> Self {
        self.key_root = path_prefix.trim_end_matches('/').to_string();
        self
    }

    pub fn with_update_policy(
        mut self,
        policy: BackoffPolicy,
    ) -> Self {
        self.update_policy = policy;
        self
    }

    pub fn with_watch_buffer_size(
        mut self,
        size: usize,
    ) -> Self {
        self.watch_buffer_size = size;
        self
    }

    pub fn with_metrics(
        mut self,
        metrics: Arc<StorageMetrics>,
    ) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Absolute backend key for `key`.
    fn prepare_key(
        &self,
        key: &str,
    ) -> Result<String> {
        let relative = key.trim_start_matches('/');
        if relative.is_empty() {
            return Err(StorageError::invalid(key, "key must not be empty or the root").into());
        }
        if relative.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(StorageError::invalid(key, "key must not contain '.' or '..' segments").into());
        }
        Ok(format!("{}/{}", self.key_root, relative))
    }

    fn versioner_ref(&self) -> &dyn Versioner {
        self.decoder.versioner.as_ref()
    }

    fn record_conflict(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.guaranteed_update_conflicts.with_label_values(&[self.resource.as_str()]).inc();
        }
    }

    /// Fails with `Timeout` when `minimum` is ahead of the backend.
    fn validate_minimum_resource_version(
        &self,
        minimum: u64,
        current: u64,
    ) -> Result<()> {
        if minimum > current {
            return Err(StorageError::Timeout {
                requested: minimum,
                current,
            }
            .into());
        }
        Ok(())
    }

    async fn state_from_kv(
        &self,
        full_key: &str,
        kv: Option<KeyValue>,
        ignore_not_found: bool,
    ) -> Result<ObjState<T>> {
        match kv {
            Some(kv) => {
                let (obj, data, stale) = self.decoder.decode(&kv).await?;
                Ok(ObjState {
                    obj,
                    meta: ResponseMeta {
                        ttl: remaining_ttl_secs(kv.expires_at, now_ms()),
                        resource_version: kv.mod_revision,
                    },
                    rev: kv.mod_revision,
                    data,
                    stale,
                    exists: true,
                })
            }
            None if ignore_not_found => Ok(ObjState {
                obj: T::default(),
                meta: ResponseMeta::default(),
                rev: 0,
                data: Vec::new(),
                stale: false,
                exists: false,
            }),
            None => Err(StorageError::not_found(full_key).into()),
        }
    }

    async fn read_state(
        &self,
        full_key: &str,
        ignore_not_found: bool,
    ) -> Result<ObjState<T>> {
        let kv = self.backend.get(full_key).await?;
        self.state_from_kv(full_key, kv, ignore_not_found).await
    }

    /// State built from a caller's cached copy, without touching storage.
    fn state_from_suggestion(
        &self,
        obj: T,
    ) -> Result<ObjState<T>> {
        let rev = self.versioner_ref().object_resource_version(obj.meta())?;
        let mut prepared = obj.clone();
        self.versioner_ref().prepare_object_for_storage(prepared.meta_mut());
        let data = self.decoder.codec.encode(&prepared)?;
        Ok(ObjState {
            obj,
            meta: ResponseMeta {
                ttl: None,
                resource_version: rev,
            },
            rev,
            data,
            stale: false,
            exists: true,
        })
    }

    fn list_prefix(
        &self,
        full_key: &str,
    ) -> String {
        format!("{}/", full_key.trim_end_matches('/'))
    }
}

#[async_trait]
impl<T: Object> Interface<T> for KvStore<T> {
    fn versioner(&self) -> Arc<dyn Versioner> {
        self.decoder.versioner.clone()
    }

    async fn create(
        &self,
        key: &str,
        obj: T,
        ttl: Option<u64>,
    ) -> Result<T> {
        let full_key = self.prepare_key(key)?;
        if self.versioner_ref().object_resource_version(obj.meta())? != 0 {
            return Err(StorageError::invalid(key, "resourceVersion should not be set on objects to be created").into());
        }

        let mut obj = obj;
        self.versioner_ref().prepare_object_for_storage(obj.meta_mut());
        let data = self.decoder.codec.encode(&obj)?;
        let value = self.decoder.encode(&full_key, &data).await?;

        match self.backend.create(&full_key, value, ttl).await? {
            TxnOutcome::Succeeded { revision } => {
                trace!(key = %full_key, revision, "created");
                self.versioner_ref().update_object(obj.meta_mut(), revision);
                Ok(obj)
            }
            TxnOutcome::Failed { .. } => Err(StorageError::AlreadyExists { key: full_key }.into()),
        }
    }

    async fn delete<'a>(
        &self,
        key: &str,
        preconditions: Option<&'a Preconditions>,
        validate_deletion: Option<ValidateDeletionFunc<'a, T>>,
        cached_existing: Option<T>,
    ) -> Result<T> {
        let full_key = self.prepare_key(key)?;
        let mut backoff = Backoff::new(self.update_policy);

        let mut from_suggestion = cached_existing.is_some();
        let mut state = match cached_existing {
            Some(obj) => self.state_from_suggestion(obj)?,
            None => self.read_state(&full_key, false).await?,
        };

        loop {
            let checked = match preconditions {
                Some(p) => p.check(key, &state.obj),
                None => Ok(()),
            }
            .and_then(|_| match validate_deletion {
                Some(validate) => validate(&state.obj),
                None => Ok(()),
            });
            if let Err(e) = checked {
                if from_suggestion {
                    state = self.read_state(&full_key, false).await?;
                    from_suggestion = false;
                    continue;
                }
                return Err(e);
            }

            match self.backend.compare_and_delete(&full_key, state.rev).await? {
                TxnOutcome::Succeeded { revision } => {
                    debug!(key = %full_key, revision, "deleted");
                    let mut obj = state.obj;
                    self.versioner_ref().update_object(obj.meta_mut(), revision);
                    return Ok(obj);
                }
                TxnOutcome::Failed { current } => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(StorageError::conflict(
                            key,
                            format!("delete gave up after {} conflicting attempts", backoff.attempts()),
                        )
                        .into());
                    };
                    trace!(key = %full_key, "delete raced with a concurrent write, retrying");
                    tokio::time::sleep(delay).await;
                    state = self.state_from_kv(&full_key, current, false).await?;
                    from_suggestion = false;
                }
            }
        }
    }

    async fn watch(
        &self,
        key: &str,
        opts: ListOptions,
    ) -> Result<WatchHandle<T>> {
        let full_key = self.prepare_key(key)?;
        let relative_key = full_key.strip_prefix(&self.key_root).unwrap_or(&full_key).to_string();
        let rv = self.versioner_ref().parse_resource_version(&opts.resource_version)?;
        let watch_prefix = if opts.recursive {
            self.list_prefix(&full_key)
        } else {
            full_key.clone()
        };
        let filter = WatchFilter::new(relative_key, opts.recursive, opts.predicate);

        // Version 0 starts with the current state as synthetic ADDED events
        let (initial, start_revision) = if rv == 0 {
            let snapshot = self.backend.range(&watch_prefix, 0).await?;
            let start = snapshot.revision + 1;
            (snapshot.kvs, start)
        } else {
            let start = rv.checked_add(1).ok_or_else(|| {
                StorageError::invalid(key, format!("resource version {rv} is out of range"))
            })?;
            (Vec::new(), start)
        };
        let stream = self.backend.watch(&watch_prefix, start_revision).await?;

        let (sender, handle) = watch_channel(self.watch_buffer_size);
        let decoder = self.decoder.clone();
        let key_root = self.key_root.clone();
        debug!(key = %full_key, start_revision, "starting storage watch");

        tokio::spawn(async move {
            run_watch(decoder, key_root, filter, initial, stream, sender).await;
        });

        Ok(handle)
    }

    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
    ) -> Result<T> {
        let full_key = self.prepare_key(key)?;
        let minimum = self.versioner_ref().parse_resource_version(&opts.resource_version)?;

        let kv = self.backend.get(&full_key).await?;
        self.validate_minimum_resource_version(minimum, self.backend.current_revision())?;

        match kv {
            Some(kv) => Ok(self.decoder.decode(&kv).await?.0),
            None if opts.ignore_not_found => Ok(T::default()),
            None => Err(StorageError::not_found(full_key).into()),
        }
    }

    async fn get_to_list(
        &self,
        key: &str,
        opts: ListOptions,
    ) -> Result<ObjectList<T>> {
        let full_key = self.prepare_key(key)?;
        let rv = self.versioner_ref().parse_resource_version(&opts.resource_version)?;

        let read_revision = match opts.resource_version_match {
            ResourceVersionMatch::Exact if rv > 0 => rv,
            _ => 0,
        };
        let range = self.backend.range(&full_key, read_revision).await?;
        self.validate_minimum_resource_version(rv, range.revision)?;

        let mut list = ObjectList::default();
        if let Some(kv) = range.kvs.iter().find(|kv| kv.key == full_key) {
            let (obj, _, _) = self.decoder.decode(kv).await?;
            if opts.predicate.matches_object(&obj, &self.decoder.attr_func)? {
                list.items.push(obj);
            }
        }
        self.versioner_ref().update_list(&mut list.metadata, range.revision, "", None)?;
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

        let full_key = self.prepare_key(key)?;
        let prefix = self.list_prefix(&full_key);
        let rv = self.versioner_ref().parse_resource_version(&opts.resource_version)?;
        let predicate = &opts.predicate;

        let (from_key, read_revision) = if !predicate.continue_token.is_empty() {
            if rv != 0 {
                return Err(StorageError::invalid(
                    key,
                    "specifying resource version is not allowed when using continue",
                )
                .into());
            }
            let (from_key, token_rv) = decode_continue(&predicate.continue_token, &prefix)?;
            (Some(from_key), token_rv)
        } else {
            match opts.resource_version_match {
                ResourceVersionMatch::Exact if rv > 0 => (None, rv),
                _ => (None, 0),
            }
        };

        let range = self.backend.range(&prefix, read_revision).await?;
        self.validate_minimum_resource_version(rv, range.revision)?;

        let start = match &from_key {
            Some(from) => range.kvs.partition_point(|kv| kv.key < *from),
            None => 0,
        };
        let kvs = &range.kvs[start..];

        let mut items = Vec::new();
        let mut next = None;
        for (i, kv) in kvs.iter().enumerate() {
            if predicate.has_limit() && items.len() as i64 >= predicate.limit {
                next = Some(i);
                break;
            }
            let (obj, _, _) = self.decoder.decode(kv).await?;
            if predicate.matches_object(&obj, &self.decoder.attr_func)? {
                items.push(obj);
            }
        }

        let mut metadata = ListMeta::default();
        let (continue_token, remaining) = match next {
            Some(i) => {
                let token = encode_continue(&kvs[i].key, &prefix, range.revision)?;
                let remaining = predicate.is_everything().then(|| (kvs.len() - i) as i64);
                (token, remaining)
            }
            None => (String::new(), None),
        };
        self.versioner_ref()
            .update_list(&mut metadata, range.revision, &continue_token, remaining)?;

        Ok(ObjectList { metadata, items })
    }

    async fn count(
        &self,
        key: &str,
    ) -> Result<u64> {
        let full_key = self.prepare_key(key)?;
        self.backend.count(&self.list_prefix(&full_key)).await
    }

    async fn guaranteed_update<'a>(
        &self,
        key: &str,
        ignore_not_found: bool,
        preconditions: Option<&'a Preconditions>,
        try_update: UpdateFunc<'a, T>,
        cached_existing: Option<T>,
    ) -> Result<T> {
        let full_key = self.prepare_key(key)?;
        let mut backoff = Backoff::new(self.update_policy);

        let mut from_suggestion = cached_existing.is_some();
        let mut state = match cached_existing {
            Some(obj) => self.state_from_suggestion(obj)?,
            None => self.read_state(&full_key, ignore_not_found).await?,
        };

        loop {
            if let Some(p) = preconditions {
                if let Err(e) = p.check(key, &state.obj) {
                    if from_suggestion {
                        state = self.read_state(&full_key, ignore_not_found).await?;
                        from_suggestion = false;
                        continue;
                    }
                    return Err(e);
                }
            }

            let (mut desired, ttl) = match try_update(state.obj.clone(), state.meta) {
                Ok(updated) => updated,
                Err(e) => {
                    if from_suggestion {
                        state = self.read_state(&full_key, ignore_not_found).await?;
                        from_suggestion = false;
                        continue;
                    }
                    return Err(e);
                }
            };

            self.versioner_ref().prepare_object_for_storage(desired.meta_mut());
            let data = self.decoder.codec.encode(&desired)?;

            if !state.stale && state.exists && data == state.data {
                // A cached copy may be out of date, confirm against storage
                if from_suggestion {
                    state = self.read_state(&full_key, ignore_not_found).await?;
                    from_suggestion = false;
                    continue;
                }
                trace!(key = %full_key, "update is a no-op");
                return Ok(state.obj);
            }

            let value = self.decoder.encode(&full_key, &data).await?;
            let outcome = with_timeout(backoff.op_timeout(), "guaranteed update", async {
                if state.exists {
                    self.backend.compare_and_swap(&full_key, state.rev, value, ttl).await
                } else {
                    self.backend.create(&full_key, value, ttl).await
                }
            })
            .await?;

            match outcome {
                TxnOutcome::Succeeded { revision } => {
                    trace!(key = %full_key, revision, "updated");
                    self.versioner_ref().update_object(desired.meta_mut(), revision);
                    return Ok(desired);
                }
                TxnOutcome::Failed { current } => {
                    self.record_conflict();
                    let Some(delay) = backoff.next_delay() else {
                        warn!(key = %full_key, attempts = backoff.attempts(), "giving up on contended update");
                        return Err(StorageError::conflict(
                            key,
                            format!("update gave up after {} conflicting attempts", backoff.attempts()),
                        )
                        .into());
                    };
                    trace!(key = %full_key, ?delay, "compare-and-swap lost a race, retrying");
                    tokio::time::sleep(delay).await;
                    state = self.state_from_kv(&full_key, current, ignore_not_found).await?;
                    from_suggestion = false;
                }
            }
        }
    }
}

/// Pumps backend changes into one watch until either side goes away.
async fn run_watch<T: Object>(
    decoder: ObjectDecoder<T>,
    key_root: String,
    filter: WatchFilter,
    initial: Vec<KeyValue>,
    mut stream: KvWatchStream,
    sender: WatchSender<T>,
) {
    for kv in &initial {
        let event = match decoder.decode(kv).await {
            Ok((obj, _, _)) => match filter.predicate().matches_object(&obj, &decoder.attr_func) {
                Ok(true) => WatchEvent::Added(obj),
                Ok(false) => continue,
                Err(e) => WatchEvent::Error(e.to_status()),
            },
            Err(e) => WatchEvent::Error(e.to_status()),
        };
        let is_error = matches!(event, WatchEvent::Error(_));
        if !sender.send(event).await || is_error {
            return;
        }
    }

    loop {
        let next = tokio::select! {
            _ = sender.cancelled() => break,
            next = stream.recv() => next,
        };

        let event = match next {
            None => break,
            Some(Err(e)) => {
                warn!("storage watch stream failed: {:?}", e);
                sender.send(WatchEvent::Error(e.to_status())).await;
                break;
            }
            Some(Ok(event)) => event,
        };

        match decoder.to_event(&event, &key_root).await {
            Ok(Some(cache_event)) => {
                if let Some(out) = filter.convert(&cache_event, decoder.versioner.as_ref()) {
                    if !sender.send(out).await {
                        break;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %event.key(), "failed to decode watch event: {:?}", e);
                sender.send(WatchEvent::Error(e.to_status())).await;
                break;
            }
        }
    }
    debug!("storage watch finished");
}
