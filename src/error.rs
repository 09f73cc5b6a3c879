//! Error types for s3mirror
//!
//! This module defines all error types used throughout the crate. Job-level
//! failures (`ListingFailed`, `KeysNotFound`) abort a job before any task is
//! submitted; `TransferFailed` is isolated to a single task and only ever
//! surfaces through job status.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for s3mirror operations
#[derive(Error, Debug)]
pub enum MirrorError {
    /// I/O error during local file or state operations
    #[error("I/O error at '{path}': {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Bucket or root of a storage location does not exist
    #[error("Storage location not found: {0}")]
    LocationNotFound(String),

    /// Source object does not exist
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Failure reported by a storage backend
    #[error("Storage error: {0}")]
    Storage(String),

    /// Location string could not be parsed
    #[error("Invalid storage location: {0}")]
    InvalidLocation(String),

    /// Enumeration exhausted its retry budget
    #[error("Listing '{location}' failed after {attempts} attempts: {message}")]
    ListingFailed {
        /// Location being listed
        location: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        message: String,
    },

    /// Caller requested keys that are absent from the source listing
    #[error("Keys not found in source: {}", keys.join(", "))]
    KeysNotFound {
        /// Missing keys in request order
        keys: Vec<String>,
    },

    /// A single transfer exhausted its retry budget
    #[error("Transfer of '{key}' failed after {attempts} attempts: {message}")]
    TransferFailed {
        /// Object key
        key: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        message: String,
    },

    /// Unknown job handle
    #[error("Transfer not found: {0}")]
    JobNotFound(String),

    /// Caller-chosen job handle cannot be stored
    #[error("Invalid job handle '{0}': use only letters, digits, '-' and '_'")]
    InvalidJobHandle(String),

    /// A write-once event was published twice
    #[error("Event '{key}' already published for job {job}")]
    AlreadyPublished {
        /// Job handle
        job: String,
        /// Event key
        key: String,
    },

    /// Execution journal is inconsistent or unreadable
    #[error("Journal error: {0}")]
    Journal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Listener or connection error
    #[error("Connection error to '{host}': {message}")]
    ConnectionError {
        /// Remote or local address
        host: String,
        /// Failure description
        message: String,
    },

    /// Execution was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,
}

impl MirrorError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create a connection error
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionError {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a storage backend error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Check if this error is worth retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Storage(_) | Self::ConnectionError { .. }
        )
    }

    /// Stable machine-readable code used by the HTTP API
    pub fn code(&self) -> &'static str {
        match self {
            Self::KeysNotFound { .. } => "KEYS_NOT_FOUND",
            Self::ListingFailed { .. } => "LISTING_FAILED",
            Self::TransferFailed { .. } => "TRANSFER_FAILED",
            Self::JobNotFound(_) => "NOT_FOUND",
            Self::InvalidLocation(_) | Self::InvalidJobHandle(_) | Self::ConfigError(_) => "BAD_REQUEST",
            Self::Cancelled => "CANCELLED",
            _ => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for s3mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        MirrorError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Journal(err.to_string())
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| MirrorError::io(path, e))
    }
}
