//! Error types for Keyhive operations
//!
//! Every fallible call returns a [`StoreError`]. Each variant maps onto one
//! [`ErrorKind`] and carries enough context to explain what went wrong.
//! Absence, capacity and decryption failures are ordinary errors; nothing
//! in the engine panics on them.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidHandle,
    NotFound,
    Corrupt,
    Full,
    Decrypt,
    ResourceInUse,
    Empty,
    Config,
    Io,
    ReadOnly,
    InvalidArgument,
    Cancelled,
}

/// Keyhive error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The handle was closed or never opened
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Key, subkey or attribute is absent (or expired)
    #[error("not found: {0}")]
    NotFound(String),

    /// An on-disk structure failed a consistency check
    #[error("corrupt structure in {} at offset {offset}: {reason}", display_path(.path))]
    Corrupt {
        /// Backing file, if the store is file-backed
        path: Option<PathBuf>,
        /// Byte offset where the inconsistency was detected
        offset: u64,
        /// Description of the inconsistency
        reason: String,
    },

    /// Collision chains cannot grow any further
    #[error("store full: {0}")]
    Full(String),

    /// No password in the ring decrypts the value
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// The store still has live dependents
    #[error("resource in use: {what} ({count} live)")]
    ResourceInUse {
        /// Kind of dependent still alive
        what: String,
        /// Number of live dependents
        count: usize,
    },

    /// Pop on an empty queue
    #[error("queue empty: {0}")]
    Empty(String),

    /// Invalid configuration or option value
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", io_location(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A mutation was attempted on a read-only store
    #[error("store is read-only: {0}")]
    ReadOnly(String),

    /// The caller passed an argument the operation cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A cancel flag was observed between units of work
    #[error("cancelled after {completed} units of work")]
    Cancelled {
        /// Units of work finished before the flag was seen
        completed: usize,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => p.display().to_string(),
        None => "<memory>".to_string(),
    }
}

fn io_location(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

impl StoreError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidHandle(_) => ErrorKind::InvalidHandle,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Corrupt { .. } => ErrorKind::Corrupt,
            StoreError::Full(_) => ErrorKind::Full,
            StoreError::Decrypt(_) => ErrorKind::Decrypt,
            StoreError::ResourceInUse { .. } => ErrorKind::ResourceInUse,
            StoreError::Empty(_) => ErrorKind::Empty,
            StoreError::Config(_) => ErrorKind::Config,
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::ReadOnly(_) => ErrorKind::ReadOnly,
            StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StoreError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// True for `NotFound` and `Empty`, which callers treat as control flow.
    pub fn is_absence(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::Empty)
    }

    /// Build an `Io` error that remembers the file it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: &std::io::Error, context: &str) -> Self {
        StoreError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    pub(crate) fn not_found_key(key: &[u8]) -> Self {
        StoreError::NotFound(format!("key {}", crate::record::printable(key)))
    }
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for Keyhive operations
pub type StoreResult<T> = Result<T, StoreError>;
