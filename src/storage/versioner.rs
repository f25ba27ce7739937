use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::CONTINUE_TOKEN_VERSION;
use crate::ListMeta;
use crate::ObjectMeta;
use crate::Result;
use crate::StorageError;

/// Maps backend revisions onto the `resourceVersion` carried by objects and
/// lists.
pub trait Versioner: Send + Sync + 'static {
    /// Stamps `resource_version` on a read result; 0 clears it.
    fn update_object(
        &self,
        meta: &mut ObjectMeta,
        resource_version: u64,
    );

    fn update_list(
        &self,
        meta: &mut ListMeta,
        resource_version: u64,
        continue_token: &str,
        remaining_item_count: Option<i64>,
    ) -> Result<()>;

    /// Strips fields that must never be persisted.
    fn prepare_object_for_storage(
        &self,
        meta: &mut ObjectMeta,
    );

    fn object_resource_version(
        &self,
        meta: &ObjectMeta,
    ) -> Result<u64>;

    /// `""` and `"0"` both mean "unspecified" and parse to 0.
    fn parse_resource_version(
        &self,
        resource_version: &str,
    ) -> Result<u64>;
}

/// Decimal string resource versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiObjectVersioner;

impl Versioner for ApiObjectVersioner {
    fn update_object(
        &self,
        meta: &mut ObjectMeta,
        resource_version: u64,
    ) {
        meta.resource_version = if resource_version == 0 {
            String::new()
        } else {
            resource_version.to_string()
        };
    }

    fn update_list(
        &self,
        meta: &mut ListMeta,
        resource_version: u64,
        continue_token: &str,
        remaining_item_count: Option<i64>,
    ) -> Result<()> {
        if resource_version == 0 {
            return Err(StorageError::Internal("illegal resource version from storage: 0".into()).into());
        }
        meta.resource_version = resource_version.to_string();
        meta.continue_token = continue_token.to_string();
        meta.remaining_item_count = remaining_item_count;
        Ok(())
    }

    fn prepare_object_for_storage(
        &self,
        meta: &mut ObjectMeta,
    ) {
        meta.resource_version.clear();
        meta.self_link.clear();
    }

    fn object_resource_version(
        &self,
        meta: &ObjectMeta,
    ) -> Result<u64> {
        self.parse_resource_version(&meta.resource_version)
    }

    fn parse_resource_version(
        &self,
        resource_version: &str,
    ) -> Result<u64> {
        if resource_version.is_empty() || resource_version == "0" {
            return Ok(0);
        }
        resource_version.parse::<u64>().map_err(|e| {
            StorageError::invalid(
                "resourceVersion",
                format!("invalid resource version {resource_version:?}: {e}"),
            )
            .into()
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ContinueToken {
    v: String,
    rv: u64,
    start: String,
}

/// Builds the opaque token resuming a list at `key` within the snapshot at
/// `resource_version`.
pub fn encode_continue(
    key: &str,
    key_prefix: &str,
    resource_version: u64,
) -> Result<String> {
    let start = key.strip_prefix(key_prefix).ok_or_else(|| {
        StorageError::Internal(format!(
            "unable to encode next field: the next key {key:?} is not relative to {key_prefix:?}"
        ))
    })?;

    let token = ContinueToken {
        v: CONTINUE_TOKEN_VERSION.to_string(),
        rv: resource_version,
        start: start.to_string(),
    };
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&token)?))
}

/// Returns the absolute key to resume from and the snapshot revision.
pub fn decode_continue(
    token: &str,
    key_prefix: &str,
) -> Result<(String, u64)> {
    let invalid = |message: String| StorageError::invalid("continue", message);

    let data = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| invalid(format!("continue key is not valid: {e}")))?;
    let token: ContinueToken = serde_json::from_slice(&data)
        .map_err(|e| invalid(format!("continue key is not valid: {e}")))?;

    if token.v != CONTINUE_TOKEN_VERSION {
        return Err(invalid(
            "continue key is not valid: server does not recognize this encoded version".into(),
        )
        .into());
    }
    if token.rv == 0 {
        return Err(invalid("continue key is not valid: incorrect encoded start resourceVersion".into()).into());
    }
    if token.start.is_empty() {
        return Err(invalid("continue key is not valid: encoded start key empty".into()).into());
    }

    let relative = token.start.strip_prefix('/').unwrap_or(&token.start);
    if relative.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(invalid(format!("continue key is not valid: {}", token.start)).into());
    }

    Ok((format!("{key_prefix}{relative}"), token.rv))
}
