use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::build_info::BuildInfo;
use crate::criteria::CriteriaConfig;
use crate::error::{InstanceError, InstanceResult};

/// Everything an [`Instance`](crate::Instance) needs to start.
///
/// ```toml
/// target_dir = "/opt/product"
/// state_dir = "/var/lib/aup"
/// import_dir = "/var/lib/aup/incoming"
///
/// [[target]]
/// file_kind = ["minimal"]
///
/// [[buffer]]
/// provider = ["*"]
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Directory kept in sync with the target audience.
    pub target_dir: PathBuf,
    /// Catalog and blob storage.
    pub state_dir: PathBuf,
    /// Staging directory polled for bundles. Disabled when unset.
    pub import_dir: Option<PathBuf>,
    /// How long a bundle must stay unmodified before it is ingested.
    pub import_dwell_secs: u64,
    /// Upper bound on how long a catalog change stays unsaved.
    pub catalog_save_interval_ms: u64,
    /// Capacity of each subscriber's event channel.
    pub event_capacity: usize,
    /// Values substituted for `same` in criteria.
    pub build_info: BuildInfo,
    pub target: Vec<CriteriaConfig>,
    pub buffer: Vec<CriteriaConfig>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            target_dir: PathBuf::from(".."),
            state_dir: PathBuf::from("../var/aup"),
            import_dir: None,
            import_dwell_secs: 10,
            catalog_save_interval_ms: 1000,
            event_capacity: 1024,
            build_info: BuildInfo::current(),
            target: vec![CriteriaConfig::default()],
            buffer: Vec::new(),
        }
    }
}

impl InstanceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Read a TOML file. Relative directories resolve against the file's
    /// own directory.
    pub fn load(path: &Path) -> InstanceResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| InstanceError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_toml_str(&text).map_err(|e| InstanceError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn resolve_relative_to(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.target_dir);
        rebase(&mut self.state_dir);
        if let Some(dir) = self.import_dir.as_mut() {
            rebase(dir);
        }
    }

    pub fn import_dwell(&self) -> Duration {
        Duration::from_secs(self.import_dwell_secs)
    }

    pub fn catalog_save_interval(&self) -> Duration {
        Duration::from_millis(self.catalog_save_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = InstanceConfig::default();
        assert_eq!(c.target_dir, PathBuf::from(".."));
        assert_eq!(c.state_dir, PathBuf::from("../var/aup"));
        assert!(c.import_dir.is_none());
        assert_eq!(c.import_dwell(), Duration::from_secs(10));
        assert_eq!(c.catalog_save_interval(), Duration::from_secs(1));
        assert_eq!(c.target.len(), 1);
        assert!(c.buffer.is_empty());
    }

    #[test]
    fn parse_criteria_tables() {
        let c = InstanceConfig::from_toml_str(
            r#"
            import_dwell_secs = 3

            [build_info]
            provider = "acme"

            [[target]]
            file_kind = ["*", "-src"]

            [[buffer]]
            provider = ["*"]
            stability = ["0-2"]
            "#,
        )
        .unwrap();
        assert_eq!(c.import_dwell_secs, 3);
        assert_eq!(c.build_info.provider, "acme");
        assert_eq!(c.target[0].file_kind, vec!["*", "-src"]);
        assert_eq!(c.buffer[0].stability, vec!["0-2"]);
        assert!(c.buffer[0].unit.is_empty());
    }

    #[test]
    fn load_resolves_relative_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aup.toml");
        fs::write(&path, "state_dir = \"state\"\nimport_dir = \"/abs/in\"\n").unwrap();
        let c = InstanceConfig::load(&path).unwrap();
        assert_eq!(c.state_dir, dir.path().join("state"));
        assert_eq!(c.target_dir, dir.path().join(".."));
        assert_eq!(c.import_dir, Some(PathBuf::from("/abs/in")));
    }

    #[test]
    fn load_reports_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aup.toml");
        fs::write(&path, "import_dwell_secs = \"soon\"").unwrap();
        assert!(matches!(
            InstanceConfig::load(&path),
            Err(InstanceError::Config { .. })
        ));
    }
}
