//! On-disk blob storage for aup.
//!
//! Blobs are addressed either by content [`Oid`](aup_types::Oid), sharded by
//! the first digest byte, or by a name confined to the storage root. The
//! store never interprets blob contents.
//!
//! # Key Types
//!
//! - [`Storage`] — Directory-backed blob store with optional self-repair
//! - [`StorageKey`] — Oid or named address
//! - [`StorageError`] — Failures with operation and path context

pub mod error;
pub mod key;
pub mod storage;

pub use error::{StorageError, StorageResult};
pub use key::StorageKey;
pub use storage::Storage;
