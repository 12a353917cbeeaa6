//! Foundation types for aup, the content-addressed software deployment engine.
//!
//! Every other aup crate depends on `aup-types`.
//!
//! # Key Types
//!
//! - [`Oid`] — 32-byte content identifier (BLAKE3 digest)
//! - [`FileKind`] — Role classification of a deployable file

pub mod error;
pub mod file_kind;
pub mod oid;

pub use error::TypeError;
pub use file_kind::FileKind;
pub use oid::Oid;
