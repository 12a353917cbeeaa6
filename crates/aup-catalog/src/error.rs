use thiserror::Error;

/// Errors from catalog encoding and decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("corrupted catalog: {0}")]
    Corrupted(String),

    #[error("unknown object type tag {0:#04x}")]
    UnknownObjectType(u8),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

impl CatalogError {
    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corrupted(reason.into())
    }
}
