//! Label/field selection and the key and attribute functions that feed it.

use std::fmt;
use std::sync::Arc;

use crate::EventType;
use crate::Fields;
use crate::Labels;
use crate::Object;
use crate::Result;
use crate::StorageError;
use crate::Versioner;
use crate::WatchCacheEvent;
use crate::WatchEvent;
use crate::FIELD_METADATA_NAME;
use crate::FIELD_METADATA_NAMESPACE;

/// Computes the storage key of an object.
pub type KeyFunc<T> = Arc<dyn Fn(&T) -> Result<String> + Send + Sync>;

/// Extracts the labels and selectable fields of an object.
pub type AttrFunc<T> = Arc<dyn Fn(&T) -> Result<(Labels, Fields)> + Send + Sync>;

/// `{prefix}/{namespace}/{name}`, or `{prefix}/{name}` for cluster scoped
/// objects.
pub fn namespace_key_func<T: Object>(prefix: impl Into<String>) -> KeyFunc<T> {
    let prefix = prefix.into();
    Arc::new(move |obj: &T| {
        let meta = obj.meta();
        if meta.name.is_empty() {
            return Err(StorageError::invalid(&prefix, "name parameter required").into());
        }
        if meta.name.contains('/') || meta.namespace.contains('/') {
            return Err(StorageError::invalid(&meta.name, "name may not contain '/'").into());
        }
        if meta.namespace.is_empty() {
            Ok(format!("{}/{}", prefix, meta.name))
        } else {
            Ok(format!("{}/{}/{}", prefix, meta.namespace, meta.name))
        }
    })
}

/// Labels plus the `metadata.name` and `metadata.namespace` fields.
pub fn default_attr_func<T: Object>() -> AttrFunc<T> {
    Arc::new(|obj: &T| {
        let meta = obj.meta();
        let mut fields = Fields::new();
        fields.insert(FIELD_METADATA_NAME.to_string(), meta.name.clone());
        fields.insert(FIELD_METADATA_NAMESPACE.to_string(), meta.namespace.clone());
        Ok((meta.labels.clone(), fields))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

impl Requirement {
    fn matches(
        &self,
        set: &Labels,
    ) -> bool {
        match self.operator {
            Operator::Equals => set.get(&self.key) == Some(&self.value),
            // An absent key satisfies an inequality
            Operator::NotEquals => set.get(&self.key) != Some(&self.value),
            Operator::Exists => set.contains_key(&self.key),
            Operator::DoesNotExist => !set.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, self.value),
            Operator::NotEquals => write!(f, "{}!={}", self.key, self.value),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Conjunction of requirements over a label or field set. The empty selector
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parses `"a=b,c!=d,e,!f"`. `==` is accepted as a synonym of `=`.
    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();

        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let requirement = if let Some((key, value)) = term.split_once("!=") {
                Requirement {
                    key: key.trim().to_string(),
                    operator: Operator::NotEquals,
                    value: value.trim().to_string(),
                }
            } else if let Some(key) = term.strip_prefix('!') {
                Requirement {
                    key: key.trim().to_string(),
                    operator: Operator::DoesNotExist,
                    value: String::new(),
                }
            } else if let Some((key, value)) =
                term.split_once("==").or_else(|| term.split_once('='))
            {
                Requirement {
                    key: key.trim().to_string(),
                    operator: Operator::Equals,
                    value: value.trim().to_string(),
                }
            } else {
                Requirement {
                    key: term.to_string(),
                    operator: Operator::Exists,
                    value: String::new(),
                }
            };

            if requirement.key.is_empty() || requirement.key.contains(['=', '!']) {
                return Err(StorageError::invalid(selector, format!("invalid key in term {term:?}")).into());
            }
            if requirement.value.contains('=') || requirement.value.contains('!') {
                return Err(
                    StorageError::invalid(selector, format!("invalid value in term {term:?}")).into()
                );
            }
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    /// Exact-match selector over every pair of `set`.
    pub fn from_set(set: &Labels) -> Self {
        Self {
            requirements: set
                .iter()
                .map(|(k, v)| Requirement {
                    key: k.clone(),
                    operator: Operator::Equals,
                    value: v.clone(),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(
        &self,
        set: &Labels,
    ) -> bool {
        self.requirements.iter().all(|r| r.matches(set))
    }

    /// Value `key` must equal for this selector to match, if any.
    pub fn requires_exact_match(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.requirements
            .iter()
            .find(|r| r.key == key && r.operator == Operator::Equals)
            .map(|r| r.value.as_str())
    }
}

impl fmt::Display for Selector {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// Label and field selection plus paging for list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPredicate {
    pub label: Selector,
    pub field: Selector,
    /// Maximum items per page; 0 means no limit
    pub limit: i64,
    pub continue_token: String,
}

impl SelectionPredicate {
    pub fn everything() -> Self {
        Self::default()
    }

    /// True when neither selector constrains anything.
    pub fn is_everything(&self) -> bool {
        self.label.is_empty() && self.field.is_empty()
    }

    pub fn has_limit(&self) -> bool {
        self.limit > 0
    }

    pub fn matches(
        &self,
        labels: &Labels,
        fields: &Fields,
    ) -> bool {
        self.label.matches(labels) && self.field.matches(fields)
    }

    pub fn matches_object<T>(
        &self,
        obj: &T,
        attr_func: &AttrFunc<T>,
    ) -> Result<bool> {
        if self.is_everything() {
            return Ok(true);
        }
        let (labels, fields) = attr_func(obj)?;
        Ok(self.matches(&labels, &fields))
    }
}

/// Key range and predicate of one watch, used to turn cache events into
/// the events that watch should see.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    key: String,
    recursive: bool,
    predicate: SelectionPredicate,
}

impl WatchFilter {
    pub fn new(
        key: impl Into<String>,
        recursive: bool,
        predicate: SelectionPredicate,
    ) -> Self {
        let mut key = key.into();
        if recursive && !key.ends_with('/') {
            key.push('/');
        }
        Self {
            key,
            recursive,
            predicate,
        }
    }

    pub fn predicate(&self) -> &SelectionPredicate {
        &self.predicate
    }

    pub fn matches_key(
        &self,
        key: &str,
    ) -> bool {
        if self.recursive {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }

    /// Converts a cache event into the event this watch observes, if any.
    ///
    /// An object entering the selection is reported as `ADDED`, one leaving
    /// it as `DELETED` carrying its previous state at the event's version.
    pub fn convert<T: Object>(
        &self,
        event: &WatchCacheEvent<T>,
        versioner: &dyn Versioner,
    ) -> Option<WatchEvent<T>> {
        if event.event_type == EventType::Bookmark {
            return Some(WatchEvent::Bookmark(event.object.clone()));
        }
        if !self.matches_key(&event.key) {
            return None;
        }

        let cur_passes = event.event_type != EventType::Deleted
            && self.predicate.matches(&event.labels, &event.fields);
        let old_passes = event.prev_object.is_some()
            && self.predicate.matches(&event.prev_labels, &event.prev_fields);

        match (cur_passes, old_passes) {
            (true, true) => Some(WatchEvent::Modified(event.object.clone())),
            (true, false) => Some(WatchEvent::Added(event.object.clone())),
            (false, true) => {
                let mut prev = event.prev_object.clone()?;
                versioner.update_object(prev.meta_mut(), event.resource_version);
                Some(WatchEvent::Deleted(prev))
            }
            (false, false) => None,
        }
    }
}
