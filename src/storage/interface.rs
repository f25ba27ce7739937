use std::sync::Arc;

use async_trait::async_trait;

use crate::Object;
use crate::ObjectList;
use crate::Result;
use crate::SelectionPredicate;
use crate::StorageError;
use crate::Versioner;
use crate::WatchHandle;

/// Conditions a stored object must satisfy before a write goes through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<String>,
}

impl Preconditions {
    pub fn with_uid(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            resource_version: None,
        }
    }

    pub fn with_resource_version(resource_version: impl Into<String>) -> Self {
        Self {
            uid: None,
            resource_version: Some(resource_version.into()),
        }
    }

    /// UID mismatch is `Invalid`, resourceVersion mismatch is `Conflict`.
    pub fn check<T: Object>(
        &self,
        key: &str,
        obj: &T,
    ) -> Result<()> {
        let meta = obj.meta();
        if let Some(uid) = &self.uid {
            if *uid != meta.uid {
                return Err(StorageError::invalid(
                    key,
                    format!(
                        "Precondition failed: UID in precondition: {}, UID in object meta: {}",
                        uid, meta.uid
                    ),
                )
                .into());
            }
        }
        if let Some(rv) = &self.resource_version {
            if *rv != meta.resource_version {
                return Err(StorageError::conflict(
                    key,
                    format!(
                        "Precondition failed: ResourceVersion in precondition: {}, ResourceVersion in object meta: {}",
                        rv, meta.resource_version
                    ),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Storage facts passed to a `try_update` closure alongside the current object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Remaining time to live in seconds, if the key carries one
    pub ttl: Option<i64>,
    pub resource_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// `""` reads the latest state; otherwise the result is at least this fresh
    pub resource_version: String,
    pub ignore_not_found: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResourceVersionMatch {
    #[default]
    NotOlderThan,
    Exact,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub resource_version: String,
    pub resource_version_match: ResourceVersionMatch,
    pub predicate: SelectionPredicate,
    /// Treat the key as a prefix
    pub recursive: bool,
    /// Ask for periodic bookmark events on watches
    pub allow_watch_bookmarks: bool,
}

/// Closure computing the desired object from the current one. It may run
/// several times and must not have side effects.
pub type UpdateFunc<'a, T> = &'a (dyn Fn(T, ResponseMeta) -> Result<(T, Option<u64>)> + Send + Sync);

/// Closure vetoing a deletion after the current object has been read.
pub type ValidateDeletionFunc<'a, T> = &'a (dyn Fn(&T) -> Result<()> + Send + Sync);

/// Generic object storage.
#[async_trait]
pub trait Interface<T: Object>: Send + Sync + 'static {
    fn versioner(&self) -> Arc<dyn Versioner>;

    /// Stores `obj` at `key` if nothing is there yet, returning the stored
    /// object with its new resource version.
    async fn create(
        &self,
        key: &str,
        obj: T,
        ttl: Option<u64>,
    ) -> Result<T>;

    /// Removes `key`, returning the last state stamped with the deletion's
    /// resource version.
    async fn delete<'a>(
        &self,
        key: &str,
        preconditions: Option<&'a Preconditions>,
        validate_deletion: Option<ValidateDeletionFunc<'a, T>>,
        cached_existing: Option<T>,
    ) -> Result<T>;

    async fn watch(
        &self,
        key: &str,
        opts: ListOptions,
    ) -> Result<WatchHandle<T>>;

    async fn watch_list(
        &self,
        key: &str,
        mut opts: ListOptions,
    ) -> Result<WatchHandle<T>> {
        opts.recursive = true;
        self.watch(key, opts).await
    }

    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
    ) -> Result<T>;

    /// Single object read shaped as a list of zero or one item.
    async fn get_to_list(
        &self,
        key: &str,
        opts: ListOptions,
    ) -> Result<ObjectList<T>>;

    async fn list(
        &self,
        key: &str,
        opts: ListOptions,
    ) -> Result<ObjectList<T>>;

    async fn count(
        &self,
        key: &str,
    ) -> Result<u64>;

    /// Read-modify-write loop resilient to concurrent writers.
    ///
    /// `cached_existing` is a possibly stale current value that saves the
    /// initial read when it turns out to be fresh.
    async fn guaranteed_update<'a>(
        &self,
        key: &str,
        ignore_not_found: bool,
        preconditions: Option<&'a Preconditions>,
        try_update: UpdateFunc<'a, T>,
        cached_existing: Option<T>,
    ) -> Result<T>;
}
