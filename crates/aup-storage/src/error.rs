use std::io;
use std::path::PathBuf;

/// Errors from blob storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No root directory has been bound.
    #[error("storage is not bound to a directory")]
    Unbound,

    /// A named key is empty, absolute, or escapes the root.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// An on-disk entry has the wrong shape and auto-fix is off.
    #[error("malformed storage entry: {}", .0.display())]
    Malformed(PathBuf),

    /// I/O failure with operation context.
    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

pub(crate) fn io_err(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> StorageError {
    let path = path.into();
    move |source| StorageError::Io { op, path, source }
}
