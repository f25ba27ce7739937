//! Object model shared by every storage layer.
//!
//! The storage core is generic over the stored type. Anything implementing
//! [`Object`] exposes its [`ObjectMeta`] so the versioner can stamp resource
//! versions and the key/attribute functions can index it. Encoding to bytes is
//! delegated to a [`Codec`].

mod codec;
pub use codec::*;

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

/// Label or field set attached to an object
pub type Labels = BTreeMap<String, String>;
pub type Fields = BTreeMap<String, String>;

/// Metadata every stored object carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Opaque version stamp assigned by storage; empty on objects that were
    /// never persisted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub self_link: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
}

/// A storable API object.
///
/// `Default` yields the "zero" object returned by reads with
/// `ignore_not_found` and used as the carrier of bookmark events.
pub trait Object:
    Clone + Debug + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// Metadata of a list result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    /// Opaque token for fetching the next page; empty on the last page
    #[serde(default, rename = "continue", skip_serializing_if = "String::is_empty")]
    pub continue_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_item_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectList<T> {
    pub metadata: ListMeta,
    pub items: Vec<T>,
}

impl<T> Default for ObjectList<T> {
    fn default() -> Self {
        Self {
            metadata: ListMeta::default(),
            items: Vec::new(),
        }
    }
}
