//! Target-directory reconciliation for aup.
//!
//! An [`Applier`] derives the ideal file tree reachable from a set of
//! catalog roots, compares it with what is on disk, and applies only the
//! corrections its [`Task`] permits. Every run reports an [`Outcome`] bit
//! set. Running the same task twice on an unchanged target is a no-op the
//! second time.
//!
//! # Key Types
//!
//! - [`Applier`] — Borrowing reconciliation engine
//! - [`Task`] — Permitted actions and verbosity
//! - [`Outcome`] — Findings and fixes
//! - [`ExtraAllowed`] — Glob exemptions for unmanaged paths

pub mod applier;
pub mod error;
pub mod flags;
mod ideal;
pub mod pattern;

pub use applier::Applier;
pub use error::{ApplierError, ApplierResult};
pub use flags::{Outcome, Task};
pub use pattern::{path_glob, ExtraAllowed};
