use serde::{Deserialize, Serialize};

/// Description of the running build. Criteria entries spelled `same`
/// resolve to these values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildInfo {
    pub src_branch: String,
    pub src_revision: String,
    pub platform_os: String,
    pub platform_arch: String,
    pub compiler: String,
    pub compiler_version: String,
    pub compiler_optimization: String,
    pub provider: String,
}

impl BuildInfo {
    /// Values baked in at compile time. `AUP_SRC_BRANCH`, `AUP_SRC_REVISION`,
    /// `AUP_RUSTC_VERSION` and `AUP_PROVIDER` override the fallbacks.
    pub fn current() -> Self {
        Self {
            src_branch: option_env!("AUP_SRC_BRANCH").unwrap_or("main").to_string(),
            src_revision: option_env!("AUP_SRC_REVISION")
                .unwrap_or(env!("CARGO_PKG_VERSION"))
                .to_string(),
            platform_os: std::env::consts::OS.to_string(),
            platform_arch: std::env::consts::ARCH.to_string(),
            compiler: "rustc".to_string(),
            compiler_version: option_env!("AUP_RUSTC_VERSION").unwrap_or("").to_string(),
            compiler_optimization: if cfg!(debug_assertions) { "debug" } else { "release" }
                .to_string(),
            provider: option_env!("AUP_PROVIDER").unwrap_or("default").to_string(),
        }
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_reflects_platform() {
        let info = BuildInfo::current();
        assert_eq!(info.platform_os, std::env::consts::OS);
        assert_eq!(info.platform_arch, std::env::consts::ARCH);
        assert_eq!(info.compiler, "rustc");
    }

    #[test]
    fn partial_override_keeps_defaults() {
        let info: BuildInfo = toml::from_str("provider = \"acme\"").unwrap();
        assert_eq!(info.provider, "acme");
        assert_eq!(info.platform_os, std::env::consts::OS);
    }
}
