//! Catalog of deployment objects for aup.
//!
//! A catalog holds three kinds of immutable, content-addressed objects:
//! a [`Release`] names the [`Unit`]s of one product build, and each unit
//! names the [`File`]s it installs. Objects are identified by the BLAKE3
//! digest of their canonical encoding, so a catalog can be exchanged with
//! untrusted peers and verified object by object.
//!
//! # Key Types
//!
//! - [`Object`] — Closed sum of [`File`], [`Unit`] and [`Release`]
//! - [`Catalog`] — Oid-keyed object set with a self-verifying serialized form
//! - [`CatalogError`] — Decoding failures

pub mod catalog;
pub mod codec;
pub mod error;
pub mod object;
pub mod signing;

pub use catalog::Catalog;
pub use codec::CATALOG_MAGIC;
pub use error::{CatalogError, CatalogResult};
pub use object::{File, Object, ObjectType, Release, Unit};
