//! Error types for the filesync library

use std::path::PathBuf;
use std::sync::Arc;

/// Result type alias for filesync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for walk, diff, cache, protocol and copy operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors while enumerating a tree
    #[error("Walk error at '{path}': {message}")]
    Walk { path: PathBuf, message: String },

    /// A remote path that cannot be represented on the local filesystem
    #[error("Invalid path syntax: '{path}' {message}")]
    PathSyntax { path: String, message: String },

    /// Malformed packets, unexpected packets or an ERR sent by the peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid change cache keys
    #[error("Invalid cache key: {0}")]
    CacheKey(String),

    /// An initializer re-entered the cache with its own key
    #[error("Recursive call detected for cache key '{key}'")]
    RecursiveCall { key: String },

    /// Stat, mkdir or materialization failures while copying
    #[error("Copy error at '{path}': {message}")]
    Copy { path: PathBuf, message: String },

    /// Extended attribute failures, routed through the copy's xattr handler
    #[error("Extended attribute error for '{path}' ({key}): {message}")]
    XAttr {
        path: PathBuf,
        key: String,
        message: String,
    },

    /// Filter pattern errors
    #[error("Filter pattern error: {0}")]
    FilterPattern(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// One failure observed by several waiters of the same computation
    #[error(transparent)]
    Shared(Arc<SyncError>),

    /// Cancellation, carrying the cause recorded on the context
    #[error("Operation was cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    /// Create a new walk error
    pub fn walk_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Walk {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new path syntax error
    pub fn path_syntax_error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PathSyntax {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a new copy error
    pub fn copy_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Copy {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new extended attribute error
    pub fn xattr_error(
        path: impl Into<PathBuf>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::XAttr {
            path: path.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether this error (or the error it wraps) is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    /// Whether this error (or the error it wraps) is an IO not-found error
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}
