//! Derivation of the ideal file tree from catalog roots.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use aup_catalog::{Catalog, File, Object};
use aup_types::{FileKind, Oid};
use tracing::debug;

use crate::flags::Outcome;

/// State of one root-relative path, ideal and real.
#[derive(Debug, Default)]
pub(crate) struct Point {
    /// File the catalog wants at this path.
    pub ideal: Option<File>,
    /// Some ideal file lives below this path.
    pub required_as_dir: bool,
    /// A regular file exists here.
    pub real_file: bool,
    pub real_size: u64,
    pub real_perms: Option<u16>,
    /// The existing entry has the wrong type for this path.
    pub real_wrong: bool,
}

#[derive(Debug, Default)]
pub(crate) struct IdealTree {
    pub points: BTreeMap<PathBuf, Point>,
    pub extra_allowed: BTreeSet<String>,
}

impl IdealTree {
    /// Walk every root depth-first. Each Oid is visited at most once per
    /// derivation, across all roots.
    pub fn derive(catalogs: &[&Catalog], roots: &BTreeMap<Oid, BTreeSet<FileKind>>) -> (Self, Outcome) {
        let mut tree = Self::default();
        let mut outcome = Outcome::OK;
        let mut visited = BTreeSet::new();

        for (root, kinds) in roots {
            let mut stack = vec![*root];
            while let Some(oid) = stack.pop() {
                if !visited.insert(oid) {
                    continue;
                }
                let Some(object) = catalogs.iter().find_map(|c| c.get_ref(&oid)) else {
                    debug!(oid = %oid.short_hex(), "referenced object missing from catalog");
                    outcome |= Outcome::INCOMPLETE_CATALOG;
                    continue;
                };
                match object {
                    Object::Release(_) => {}
                    Object::Unit(unit) => {
                        tree.extra_allowed.extend(unit.extra_allowed.iter().cloned());
                    }
                    Object::File(file) => {
                        if !kinds.contains(&file.kind) {
                            continue;
                        }
                        outcome |= tree.register(file);
                    }
                }
                stack.extend(object.dependencies().iter().rev());
            }
        }

        for (path, point) in &tree.points {
            if point.required_as_dir && point.ideal.is_some() {
                debug!(path = %path.display(), "path is both a file and a directory");
                outcome |= Outcome::AMBIGUOUS_CATALOG;
            }
        }
        (tree, outcome)
    }

    fn register(&mut self, file: &File) -> Outcome {
        let Some(rel) = relative_path(&file.path) else {
            debug!(path = %file.path, "file path escapes target root");
            return Outcome::CORRUPTED_CATALOG;
        };

        for ancestor in rel.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            self.points
                .entry(ancestor.to_path_buf())
                .or_default()
                .required_as_dir = true;
        }

        let point = self.points.entry(rel).or_default();
        match &point.ideal {
            Some(existing) if !same_placement(existing, file) => {
                debug!(path = %file.path, "conflicting files for one path");
                Outcome::AMBIGUOUS_CATALOG
            }
            Some(_) => Outcome::OK,
            None => {
                point.ideal = Some(file.clone());
                Outcome::OK
            }
        }
    }
}

fn same_placement(a: &File, b: &File) -> bool {
    a.size == b.size
        && a.content == b.content
        && a.perms == b.perms
        && a.dependencies == b.dependencies
}

/// Accept only non-empty paths made of plain components.
pub(crate) fn relative_path(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aup_catalog::Unit;

    fn file(path: &str, kind: FileKind, content: &[u8]) -> File {
        File {
            kind,
            path: path.into(),
            perms: 0o644,
            size: content.len() as u64,
            content: aup_crypto::identify(content),
            ..Default::default()
        }
    }

    fn roots(oid: Oid, kinds: &[FileKind]) -> BTreeMap<Oid, BTreeSet<FileKind>> {
        [(oid, kinds.iter().copied().collect())].into_iter().collect()
    }

    #[test]
    fn relative_path_rules() {
        assert_eq!(relative_path("bin/app"), Some(PathBuf::from("bin/app")));
        assert_eq!(relative_path("./bin//app"), Some(PathBuf::from("bin/app")));
        assert_eq!(relative_path("../etc"), None);
        assert_eq!(relative_path("a/../../b"), None);
        assert_eq!(relative_path("/abs"), None);
        assert_eq!(relative_path(""), None);
    }

    #[test]
    fn ancestors_are_required_directories() {
        let mut c = Catalog::new();
        let f = c.put(Object::File(file("a/b/c.txt", FileKind::Runtime, b"x")));
        let (tree, outcome) = IdealTree::derive(&[&c], &roots(f, &[FileKind::Runtime]));
        assert!(outcome.is_ok());
        assert!(tree.points[Path::new("a")].required_as_dir);
        assert!(tree.points[Path::new("a/b")].required_as_dir);
        assert!(tree.points[Path::new("a/b/c.txt")].ideal.is_some());
    }

    #[test]
    fn filtered_file_prunes_its_subtree() {
        let mut c = Catalog::new();
        let rdep = c.put(Object::File(file("lib/dep.so", FileKind::Rdep, b"dep")));
        let mut dbg = file("bin/app.pdb", FileKind::Debug, b"dbg");
        dbg.dependencies.insert(rdep);
        let dbg = c.put(Object::File(dbg));
        let unit = c.put(Object::Unit(Unit {
            dependencies: [dbg].into_iter().collect(),
            extra_allowed: ["var/*".to_string()].into_iter().collect(),
            ..Default::default()
        }));

        let (tree, outcome) = IdealTree::derive(&[&c], &roots(unit, &FileKind::MINIMAL));
        assert!(outcome.is_ok());
        assert!(tree.points.is_empty());
        assert!(tree.extra_allowed.contains("var/*"));
    }

    #[test]
    fn conflicting_files_are_ambiguous() {
        let mut c = Catalog::new();
        let a = c.put(Object::File(file("bin/app", FileKind::Runtime, b"one")));
        let b = c.put(Object::File(file("bin/app", FileKind::Runtime, b"two")));
        let unit = c.put(Object::Unit(Unit {
            dependencies: [a, b].into_iter().collect(),
            ..Default::default()
        }));
        let (_, outcome) = IdealTree::derive(&[&c], &roots(unit, &[FileKind::Runtime]));
        assert!(outcome.contains(Outcome::AMBIGUOUS_CATALOG));
    }

    #[test]
    fn identical_placement_under_different_kinds_is_not_ambiguous() {
        let mut c = Catalog::new();
        let a = c.put(Object::File(file("bin/app", FileKind::Runtime, b"same")));
        let b = c.put(Object::File(file("bin/app", FileKind::Resource, b"same")));
        let unit = c.put(Object::Unit(Unit {
            dependencies: [a, b].into_iter().collect(),
            ..Default::default()
        }));
        let (_, outcome) =
            IdealTree::derive(&[&c], &roots(unit, &[FileKind::Runtime, FileKind::Resource]));
        assert!(outcome.is_ok());
    }

    #[test]
    fn file_over_directory_is_ambiguous() {
        let mut c = Catalog::new();
        let a = c.put(Object::File(file("share", FileKind::Runtime, b"x")));
        let b = c.put(Object::File(file("share/doc", FileKind::Runtime, b"y")));
        let unit = c.put(Object::Unit(Unit {
            dependencies: [a, b].into_iter().collect(),
            ..Default::default()
        }));
        let (_, outcome) = IdealTree::derive(&[&c], &roots(unit, &[FileKind::Runtime]));
        assert!(outcome.contains(Outcome::AMBIGUOUS_CATALOG));
    }

    #[test]
    fn missing_dependency_is_incomplete() {
        let mut c = Catalog::new();
        let unit = c.put(Object::Unit(Unit {
            dependencies: [Oid::from_hash([5; 32])].into_iter().collect(),
            ..Default::default()
        }));
        let (_, outcome) = IdealTree::derive(&[&c], &roots(unit, &[FileKind::Runtime]));
        assert_eq!(outcome, Outcome::INCOMPLETE_CATALOG);
    }

    #[test]
    fn escaping_path_is_corrupted() {
        let mut c = Catalog::new();
        let f = c.put(Object::File(file("../evil", FileKind::Runtime, b"x")));
        let (_, outcome) = IdealTree::derive(&[&c], &roots(f, &[FileKind::Runtime]));
        assert_eq!(outcome, Outcome::CORRUPTED_CATALOG);
    }
}
