use std::fmt;
use std::path::{Component, Path, PathBuf};

use aup_types::Oid;

/// Address of a blob: a content identifier or an application-chosen name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StorageKey {
    Oid(Oid),
    /// `/`-separated path relative to the storage root.
    Named(String),
}

impl StorageKey {
    /// Path of the blob below `root`, or `None` if the key would escape it.
    pub(crate) fn resolve(&self, root: &Path) -> Option<PathBuf> {
        match self {
            Self::Oid(oid) => {
                let hex = oid.to_hex();
                Some(root.join(&hex[..2]).join(&hex[2..]))
            }
            Self::Named(name) => normalize(Path::new(name)).map(|rel| root.join(rel)),
        }
    }
}

/// Lexically normalize a relative path, refusing anything that would climb
/// above its base.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

impl From<Oid> for StorageKey {
    fn from(oid: Oid) -> Self {
        Self::Oid(oid)
    }
}

impl From<&Oid> for StorageKey {
    fn from(oid: &Oid) -> Self {
        Self::Oid(*oid)
    }
}

impl From<&str> for StorageKey {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oid(oid) => write!(f, "{}", oid.short_hex()),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_keys_are_sharded_by_first_byte() {
        let oid = Oid::from_hash([0xab; 32]);
        let path = StorageKey::from(oid).resolve(Path::new("/s")).unwrap();
        assert_eq!(path, Path::new("/s/ab").join("ab".repeat(31)));
    }

    #[test]
    fn named_keys_stay_inside_root() {
        let root = Path::new("/s");
        assert_eq!(
            StorageKey::from("catalog").resolve(root),
            Some(PathBuf::from("/s/catalog"))
        );
        assert_eq!(
            StorageKey::from("a/../b/./c").resolve(root),
            Some(PathBuf::from("/s/b/c"))
        );
        assert_eq!(StorageKey::from("../etc/passwd").resolve(root), None);
        assert_eq!(StorageKey::from("a/../../x").resolve(root), None);
        assert_eq!(StorageKey::from("/etc/passwd").resolve(root), None);
        assert_eq!(StorageKey::from("").resolve(root), None);
        assert_eq!(StorageKey::from("a/..").resolve(root), None);
    }
}
