use std::collections::BTreeSet;
use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::warn;

/// Root-relative paths that may exist under the target without being
/// reported or removed as extra.
///
/// Patterns use full-path semantics: `*` and `?` never match `/`, and
/// backslash is literal.
#[derive(Debug, Clone)]
pub struct ExtraAllowed {
    set: GlobSet,
}

impl ExtraAllowed {
    /// Compile patterns. Invalid patterns are logged and ignored.
    pub fn new<'a>(patterns: impl IntoIterator<Item = &'a String>) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            match path_glob(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => warn!(pattern = %pattern, error = %e, "ignoring invalid extra-allowed pattern"),
            }
        }
        let set = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "failed to compile extra-allowed patterns");
            GlobSet::empty()
        });
        Self { set }
    }

    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
        }
    }

    pub fn matches(&self, rel: &Path) -> bool {
        self.set.is_match(rel)
    }
}

impl From<&BTreeSet<String>> for ExtraAllowed {
    fn from(patterns: &BTreeSet<String>) -> Self {
        Self::new(patterns)
    }
}

/// Compile one full-path glob.
pub fn path_glob(pattern: &str) -> Result<globset::Glob, globset::Error> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .backslash_escape(false)
        .build()
}
