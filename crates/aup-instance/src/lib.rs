//! Update agent core for aup.
//!
//! An [`Instance`] owns a catalog and a blob storage under its state
//! directory. It selects releases for two audiences with [`Criteria`],
//! tracks what each audience still lacks in an [`Index`], admits objects
//! from peers or from an import directory, collects garbage and drives an
//! applier over the target directory.
//!
//! # Key Types
//!
//! - [`Instance`] — Lifecycle, admission, garbage collection, target updates
//! - [`InstanceConfig`] — TOML configuration
//! - [`Criteria`] / [`CriteriaSet`] — Release, unit and file selection
//! - [`Index`] — Per-audience most recent releases and completeness
//! - [`InstanceEvent`] — Published state transitions

pub mod build_info;
pub mod config;
pub mod criteria;
pub mod error;
pub mod events;
pub mod exchange;
mod importer;
pub mod index;
pub mod instance;

pub use build_info::BuildInfo;
pub use config::InstanceConfig;
pub use criteria::{Criteria, CriteriaConfig, CriteriaError, CriteriaSet};
pub use error::{InstanceError, InstanceResult};
pub use events::{Audience, EventFilter, EventKind, EventStream, InstanceEvent};
pub use exchange::PutObjectResult;
pub use importer::CATALOG_KEY;
pub use index::{AudienceIndex, Index};
pub use instance::{GcReport, Instance};
