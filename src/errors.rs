//! Storage Core Error Hierarchy
//!
//! Errors are grouped by the layer that raises them. Callers that only care
//! about the failure class (should I relist? retry? give up?) use the
//! classification helpers on [`Error`] or convert to a wire [`Status`].

use serde::Deserialize;
use serde::Serialize;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object storage and backing KV failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Value transformation (encryption at rest) failures
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Object encoding/decoding failures
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Metrics registration or encoding failures
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Unrecoverable failures
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("key exists: {key}")]
    AlreadyExists { key: String },

    /// Precondition mismatch or exhausted compare-and-swap retries
    #[error("conflict on {key}: {message}")]
    Conflict { key: String, message: String },

    /// Malformed input or a precondition UID mismatch
    #[error("invalid object {key}: {message}")]
    Invalid { key: String, message: String },

    /// Requested history has been evicted or compacted; the caller must relist
    #[error("too old resource version: {requested} ({oldest})")]
    TooOld { requested: u64, oldest: u64 },

    /// Freshness wait exceeded, or the requested version is ahead of storage
    #[error("timeout waiting for resource version {requested}, current is {current}")]
    Timeout { requested: u64, current: u64 },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("internal storage error: {0}")]
    Internal(String),

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    DbError(String),

    /// Serialization failures for persisted data
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// Stored bytes cannot be parsed; fatal for that single value
    #[error("invalid data encountered by {transformer} transformer: {message}")]
    Decode {
        transformer: &'static str,
        message: String,
    },

    /// Key management service call failed or timed out
    #[error("KMS {operation} failed: {message}")]
    Kms {
        operation: &'static str,
        message: String,
    },

    /// AEAD seal/open or key construction failure
    #[error("cipher failure: {0}")]
    Cipher(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Validation failure with a human readable description
    #[error("{0}")]
    Message(String),

    /// Failure while loading configuration sources
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),
}

/// Machine readable failure class carried in a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusReason {
    NotFound,
    AlreadyExists,
    Conflict,
    Invalid,
    Gone,
    Timeout,
    ServiceUnavailable,
    InternalError,
}

impl StatusReason {
    /// HTTP-style status code for this reason.
    pub fn code(&self) -> u16 {
        match self {
            StatusReason::NotFound => 404,
            StatusReason::AlreadyExists | StatusReason::Conflict => 409,
            StatusReason::Invalid => 422,
            StatusReason::Gone => 410,
            StatusReason::Timeout => 504,
            StatusReason::ServiceUnavailable => 503,
            StatusReason::InternalError => 500,
        }
    }
}

/// Status payload carried by watch `ERROR` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub reason: StatusReason,
    pub message: String,
}

impl Status {
    pub fn new(
        reason: StatusReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: reason.code(),
            reason,
            message: message.into(),
        }
    }
}

impl Error {
    pub fn reason(&self) -> StatusReason {
        match self {
            Error::Storage(e) => match e {
                StorageError::NotFound { .. } => StatusReason::NotFound,
                StorageError::AlreadyExists { .. } => StatusReason::AlreadyExists,
                StorageError::Conflict { .. } => StatusReason::Conflict,
                StorageError::Invalid { .. } => StatusReason::Invalid,
                StorageError::TooOld { .. } => StatusReason::Gone,
                StorageError::Timeout { .. } => StatusReason::Timeout,
                StorageError::Unavailable(_) => StatusReason::ServiceUnavailable,
                StorageError::Internal(_)
                | StorageError::DbError(_)
                | StorageError::BincodeError(_) => StatusReason::InternalError,
            },
            Error::Transform(TransformError::Kms { .. }) => StatusReason::ServiceUnavailable,
            Error::Transform(_) => StatusReason::InternalError,
            Error::Config(_) => StatusReason::Invalid,
            Error::Codec(_) | Error::Metrics(_) | Error::Fatal(_) => StatusReason::InternalError,
        }
    }

    pub fn to_status(&self) -> Status {
        Status::new(self.reason(), self.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        self.reason() == StatusReason::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.reason() == StatusReason::AlreadyExists
    }

    pub fn is_conflict(&self) -> bool {
        self.reason() == StatusReason::Conflict
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Error::Storage(StorageError::Invalid { .. }))
    }

    /// The requested resource version is gone; relist instead of resuming.
    pub fn is_too_old(&self) -> bool {
        self.reason() == StatusReason::Gone
    }

    pub fn is_timeout(&self) -> bool {
        self.reason() == StatusReason::Timeout
    }

    pub fn is_unavailable(&self) -> bool {
        self.reason() == StatusReason::ServiceUnavailable
    }
}

impl StorageError {
    pub fn not_found(key: impl Into<String>) -> Self {
        StorageError::NotFound { key: key.into() }
    }

    pub fn conflict(
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        StorageError::Conflict {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn invalid(
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        StorageError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

// ============== Conversion Implementations ============== //
impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::DbError(e.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Storage(e.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Storage(StorageError::BincodeError(e))
    }
}

impl From<::config::ConfigError> for Error {
    fn from(e: ::config::ConfigError) -> Self {
        Error::Config(ConfigError::Load(e))
    }
}
