use std::io;
use std::path::PathBuf;

use aup_storage::StorageError;

/// Errors that abort an applier run. Readiness problems are not errors;
/// they are reported through [`Outcome`](crate::Outcome) flags.
#[derive(Debug, thiserror::Error)]
pub enum ApplierError {
    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type ApplierResult<T> = Result<T, ApplierError>;

pub(crate) fn io_err(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> ApplierError {
    let path = path.into();
    move |source| ApplierError::Io { op, path, source }
}
