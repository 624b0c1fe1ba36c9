//! Error Types
//!
//! Only two kinds of failure ever reach a caller of the store:
//! configuration mistakes (asking for an item that was never registered) and
//! a write that still cannot fit after every quota recovery phase ran.
//!
//! Everything else (malformed payloads, schema mismatches, failing user
//! callbacks) is recovered locally: logged, then the item decays to its default.
//! Those errors still have types so the codecs can report *why* a payload was
//! rejected.

use thiserror::Error;

/// Errors returned by public store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The logical item was never configured on this store
    #[error("unknown item: {0}")]
    UnknownItem(String),

    /// Every recovery phase ran and the write still does not fit
    #[error("storage quota exceeded while writing {key}")]
    QuotaExceeded { key: String },

    /// The substrate failed for a reason other than capacity
    #[error("backend error: {0}")]
    Backend(BackendError),

    /// A value could not be serialized
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The store could not be assembled from its configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A typed handle could not convert between its type and JSON
    #[error("item {item} does not hold the requested type: {source}")]
    Typed {
        item: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<BackendError> for StoreError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::QuotaExceeded { key, .. } => StoreError::QuotaExceeded { key },
            other => StoreError::Backend(other),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a storage substrate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The write would push the substrate over its capacity
    #[error("quota exceeded writing {key}: needed {needed} bytes, {available} available")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    /// The substrate cannot be used at all
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Returns true for the capacity-exceeded condition that triggers recovery.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, BackendError::QuotaExceeded { .. })
    }
}

/// Errors produced by a schema rejecting a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}", .messages.join("; "))]
pub struct SchemaError {
    /// One message per violated rule
    pub messages: Vec<String>,
}

impl SchemaError {
    /// Creates an error with a single message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }
}

/// Errors from compressing or decompressing a payload.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// The compressed text is not valid base64
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The compressor itself failed
    #[error("compression I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The decompressed bytes are not UTF-8 text
    #[error("decompressed payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Reasons a stored payload could not be turned back into a valid value.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON at all
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The compressed body could not be inflated
    #[error("decompression failed: {0}")]
    Compression(#[from] CompressionError),

    /// The payload was compressed with a format this item is not configured for
    #[error("compression format mismatch: expected {expected:?}, found {found}")]
    FormatMismatch {
        expected: Option<String>,
        found: String,
    },

    /// A compressed payload contained another compressed payload
    #[error("nested compression is not supported")]
    NestedCompression,

    /// The value failed validation and no migration rescued it
    #[error("validation failed: {0}")]
    Invalid(#[from] SchemaError),
}
