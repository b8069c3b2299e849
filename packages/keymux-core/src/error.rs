//! Error types for storage operations.
//!
//! Unsupported driver operations are *not* errors: the engine consults the
//! driver's capability record and degrades silently (no-op mutators, `None`
//! readers). Missing keys are represented by `None` returns, never by an
//! error variant.

use thiserror::Error;

/// Errors surfaced by the storage engine and its drivers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key contains a traversal sequence or is otherwise malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Driver was created without a required option.
    #[error("missing required driver option: {0}")]
    MissingConfig(&'static str),

    /// Value cannot be stringified for the text channel.
    #[error("cannot stringify value: {0}")]
    Serialization(String),

    /// Attempt to store a value reserved at the protocol level.
    #[error("value is reserved by the storage protocol: {0}")]
    ReservedValue(String),

    /// Filesystem backend failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Network, remote-service, or other backend failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
