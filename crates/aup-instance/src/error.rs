use std::io;
use std::path::PathBuf;

use crate::criteria::CriteriaError;

/// Errors from instance operations.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    /// The operation needs a started instance.
    #[error("instance is not started")]
    NotStarted,

    #[error("instance is already started")]
    AlreadyStarted,

    /// A criteria entry failed to parse.
    #[error(transparent)]
    Criteria(#[from] CriteriaError),

    /// The configuration file is unreadable or invalid.
    #[error("invalid configuration {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error(transparent)]
    Catalog(#[from] aup_catalog::CatalogError),

    #[error(transparent)]
    Storage(#[from] aup_storage::StorageError),

    #[error(transparent)]
    Applier(#[from] aup_applier::ApplierError),

    /// I/O failure with operation context.
    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result alias for instance operations.
pub type InstanceResult<T> = Result<T, InstanceError>;

pub(crate) fn io_err(op: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> InstanceError {
    let path = path.into();
    move |source| InstanceError::Io { op, path, source }
}
