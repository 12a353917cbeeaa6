use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use aup_catalog::{Catalog, File};
use aup_storage::Storage;
use aup_types::{FileKind, Oid};
use tracing::{debug, info, warn};

use crate::error::{io_err, ApplierError, ApplierResult};
use crate::flags::{Outcome, Task};
use crate::ideal::{IdealTree, Point};
use crate::pattern::ExtraAllowed;

/// Reconciles a target directory with the file tree reachable from a set
/// of catalog roots.
///
/// An `Applier` only borrows its catalogs and storages. Each call to
/// [`Applier::process`] starts from scratch, so repeated calls are
/// independent.
#[derive(Default)]
pub struct Applier<'a> {
    catalogs: Vec<&'a Catalog>,
    storages: Vec<&'a Storage>,
    roots: BTreeMap<Oid, BTreeSet<FileKind>>,
}

impl<'a> Applier<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a catalog. Lookups take the first catalog holding an Oid.
    pub fn add_catalog(&mut self, catalog: &'a Catalog) -> &mut Self {
        self.catalogs.push(catalog);
        self
    }

    /// Attach a storage. Content is read from the first storage holding it.
    pub fn add_storage(&mut self, storage: &'a Storage) -> &mut Self {
        self.storages.push(storage);
        self
    }

    /// Add a root object. Adding the same root twice unions the kind sets.
    pub fn add_root(&mut self, oid: Oid, kinds: impl IntoIterator<Item = FileKind>) -> &mut Self {
        self.roots.entry(oid).or_default().extend(kinds);
        self
    }

    pub fn roots(&self) -> &BTreeMap<Oid, BTreeSet<FileKind>> {
        &self.roots
    }

    /// Compare `place` with the ideal tree and apply the fixes `task`
    /// permits.
    ///
    /// Catalog or storage readiness failures return before any filesystem
    /// change. I/O errors abort the remaining work; fixes already applied
    /// stay applied.
    pub fn process(&self, place: &Path, task: Task) -> ApplierResult<Outcome> {
        let (tree, outcome) = IdealTree::derive(&self.catalogs, &self.roots);
        if outcome.failed() {
            warn!(place = %place.display(), %outcome, "catalog not ready, nothing applied");
            return Ok(outcome);
        }
        let mut run = Run {
            applier: self,
            place,
            task,
            allowed: ExtraAllowed::new(&tree.extra_allowed),
            points: tree.points,
            candidates: BTreeSet::new(),
        };
        run.scan()?;

        if task.intersects(Task::CHECK_STORAGE | Task::EMPLACE_MISSINGS | Task::EMPLACE_CHANGES) {
            let outcome = run.check_storage()?;
            if outcome.failed() {
                warn!(place = %place.display(), %outcome, "storage not ready, nothing applied");
                return Ok(outcome);
            }
        }

        let outcome = run.apply()?;
        if task.intersects(Task::VERBOSE) {
            info!(place = %place.display(), %outcome, "apply finished");
        }
        Ok(outcome)
    }

    fn open_content(&self, oid: &Oid) -> ApplierResult<Option<fs::File>> {
        for storage in &self.storages {
            if let Some(file) = storage.open_reader(oid)? {
                return Ok(Some(file));
            }
        }
        Ok(None)
    }
}

/// Scratch state of one `process` call.
struct Run<'r, 'a> {
    applier: &'r Applier<'a>,
    place: &'r Path,
    task: Task,
    allowed: ExtraAllowed,
    points: BTreeMap<PathBuf, Point>,
    /// Root-relative directories that may have become empty.
    candidates: BTreeSet<PathBuf>,
}

impl Run<'_, '_> {
    // -----------------------------------------------------------------------
    // Real tree
    // -----------------------------------------------------------------------

    fn scan(&mut self) -> ApplierResult<()> {
        if !self.place.is_dir() {
            return Ok(());
        }
        let mut walker = walkdir::WalkDir::new(self.place).min_depth(1).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(self.place).to_path_buf();
                io_err("scan", path)(io::Error::from(e))
            })?;
            let Ok(rel) = entry.path().strip_prefix(self.place).map(Path::to_path_buf) else {
                continue;
            };
            let file_type = entry.file_type();
            let point = self.points.entry(rel.clone()).or_default();

            if file_type.is_file() {
                if point.required_as_dir {
                    point.real_wrong = true;
                } else {
                    let meta = entry.metadata().map_err(|e| {
                        io_err("inspect", entry.path())(io::Error::from(e))
                    })?;
                    point.real_file = true;
                    point.real_size = meta.len();
                    point.real_perms = mode_of(&meta);
                }
            } else if file_type.is_dir() {
                if point.ideal.is_some() {
                    point.real_wrong = true;
                    walker.skip_current_dir();
                }
                self.candidates.insert(rel.clone());
            } else {
                point.real_wrong = true;
            }
            if let Some(parent) = parent_of(&rel) {
                self.candidates.insert(parent);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Storage readiness
    // -----------------------------------------------------------------------

    fn check_storage(&self) -> ApplierResult<Outcome> {
        let full = self.task.contains(Task::CHECK_STORAGE);
        let contents: BTreeSet<Oid> = self
            .points
            .values()
            .filter_map(|p| p.ideal.as_ref().map(|f| f.content))
            .collect();

        let mut outcome = Outcome::OK;
        for content in contents {
            let ready = if full {
                self.verify_content(&content)?
            } else {
                let mut present = false;
                for storage in &self.applier.storages {
                    if storage.has(content)? {
                        present = true;
                        break;
                    }
                }
                present
            };
            if !ready {
                debug!(oid = %content.short_hex(), "content unavailable");
                outcome |= Outcome::INCOMPLETE_STORAGE;
            }
        }
        Ok(outcome)
    }

    /// Re-hash the blob in each storage until one verifies. Blobs that fail
    /// are deleted.
    fn verify_content(&self, content: &Oid) -> ApplierResult<bool> {
        for storage in &self.applier.storages {
            let Some(reader) = storage.open_reader(content)? else {
                continue;
            };
            let actual = aup_crypto::identify_reader(reader)
                .map_err(io_err("hash", storage.path_of(&content.into()).unwrap_or_default()))?;
            if actual == *content {
                return Ok(true);
            }
            warn!(oid = %content.short_hex(), actual = %actual.short_hex(), "corrupted blob, deleting");
            storage.del(content)?;
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Corrective actions
    // -----------------------------------------------------------------------

    fn apply(&mut self) -> ApplierResult<Outcome> {
        let mut outcome = Outcome::OK;
        let mut cleared: BTreeSet<PathBuf> = BTreeSet::new();

        // Wrong entries first, so that missing files can take their place.
        let wrongs: Vec<PathBuf> = self
            .points
            .iter()
            .filter(|(_, p)| p.real_wrong)
            .map(|(rel, _)| rel.clone())
            .collect();
        for rel in wrongs {
            if !self.task.contains(Task::REMOVE_WRONGS) {
                self.minor("wrong", &rel);
                outcome |= Outcome::EXISTS_WRONG;
                continue;
            }
            if self.remove(&rel)? {
                cleared.insert(rel);
                outcome |= Outcome::FIXED_EXTRA;
            } else {
                outcome |= Outcome::EXISTS_WRONG;
            }
        }

        let extras: Vec<PathBuf> = self
            .points
            .iter()
            .filter(|(_, p)| p.real_file && p.ideal.is_none())
            .map(|(rel, _)| rel.clone())
            .collect();
        for rel in extras {
            if self.allowed.matches(&rel) {
                continue;
            }
            if !self.task.contains(Task::REMOVE_EXTRA) {
                self.minor("extra", &rel);
                outcome |= Outcome::EXISTS_EXTRA;
                continue;
            }
            outcome |= if self.remove(&rel)? {
                Outcome::FIXED_EXTRA
            } else {
                Outcome::EXISTS_EXTRA
            };
        }

        let ideals: Vec<(PathBuf, File)> = self
            .points
            .iter()
            .filter_map(|(rel, p)| p.ideal.clone().map(|f| (rel.clone(), f)))
            .collect();
        for (rel, file) in ideals {
            outcome |= self.reconcile(&rel, &file, &cleared)?;
            if let Some(parent) = parent_of(&rel) {
                self.candidates.insert(parent);
            }
        }

        if self.task.contains(Task::REMOVE_EXTRA) {
            outcome |= self.prune_empty_dirs()?;
        }
        Ok(outcome)
    }

    fn reconcile(&self, rel: &Path, file: &File, cleared: &BTreeSet<PathBuf>) -> ApplierResult<Outcome> {
        let point = &self.points[rel];
        let path = self.place.join(rel);

        if !point.real_file {
            // A wrong entry left in place at this path or above it.
            let blocked = rel.ancestors().any(|a| {
                self.points.get(a).is_some_and(|p| p.real_wrong) && !cleared.contains(a)
            });
            if blocked {
                self.minor("blocked", rel);
                return Ok(Outcome::EXISTS_MISSING);
            }
            if !self.task.contains(Task::EMPLACE_MISSINGS) {
                self.minor("missing", rel);
                return Ok(Outcome::EXISTS_MISSING);
            }
            self.major("emplace", rel);
            self.emplace(&path, file)?;
            return Ok(Outcome::FIXED_MISSING);
        }

        let content_changed = point.real_size != file.size || {
            let f = fs::File::open(&path).map_err(io_err("open", &path))?;
            aup_crypto::identify_reader(f).map_err(io_err("hash", &path))? != file.content
        };
        if content_changed {
            if !self.task.contains(Task::EMPLACE_CHANGES) {
                self.minor("changed", rel);
                return Ok(Outcome::EXISTS_CHANGED);
            }
            self.major("update", rel);
            return self.replace(rel, &path, file);
        }

        if point.real_perms.is_some_and(|perms| perms != file.perms) {
            if !self.task.contains(Task::EMPLACE_CHANGES) {
                self.minor("permissions changed", rel);
                return Ok(Outcome::EXISTS_CHANGED);
            }
            self.major("chmod", rel);
            set_perms(&path, file.perms)?;
            return Ok(Outcome::FIXED_CHANGED);
        }
        Ok(Outcome::OK)
    }

    /// Write the file's content at `path` and apply its permissions.
    fn emplace(&self, path: &Path, file: &File) -> ApplierResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err("create", parent))?;
        }
        let Some(mut source) = self.applier.open_content(&file.content)? else {
            return Err(ApplierError::Io {
                op: "fetch",
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "content blob vanished"),
            });
        };
        let mut target = fs::File::create(path).map_err(io_err("create", path))?;
        io::copy(&mut source, &mut target).map_err(io_err("write", path))?;
        target.sync_all().map_err(io_err("sync", path))?;
        drop(target);
        set_perms(path, file.perms)
    }

    /// Write beside the old file, remove it, then rename into place.
    fn replace(&self, rel: &Path, path: &Path, file: &File) -> ApplierResult<Outcome> {
        let tmp = path.with_extension(random_suffix());
        self.emplace(&tmp, file)?;
        if !self.remove(rel)? {
            fs::remove_file(&tmp).map_err(io_err("remove", &tmp))?;
            return Ok(Outcome::EXISTS_CHANGED);
        }
        fs::rename(&tmp, path).map_err(io_err("rename", &tmp))?;
        Ok(Outcome::FIXED_CHANGED)
    }

    /// Remove an entry of any type. A locked entry is renamed aside
    /// instead. Returns `false` if it could be neither removed nor moved.
    fn remove(&self, rel: &Path) -> ApplierResult<bool> {
        let path = self.place.join(rel);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(io_err("inspect", &path)(e)),
        };
        self.major("remove", rel);
        let result = if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if is_locked(&e) => {
                let aside = path.with_extension(random_suffix());
                match fs::rename(&path, &aside) {
                    Ok(()) => {
                        warn!(path = %path.display(), aside = %aside.display(), "locked, moved aside");
                        Ok(true)
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "locked and cannot be moved aside");
                        Ok(false)
                    }
                }
            }
            Err(e) => Err(io_err("remove", &path)(e)),
        }
    }

    /// Remove empty, non-exempt directories until none are left.
    fn prune_empty_dirs(&mut self) -> ApplierResult<Outcome> {
        let mut outcome = Outcome::OK;
        loop {
            let mut next = BTreeSet::new();
            for rel in std::mem::take(&mut self.candidates) {
                if self.allowed.matches(&rel) {
                    continue;
                }
                let path = self.place.join(&rel);
                let empty = match fs::read_dir(&path) {
                    Ok(mut entries) => entries.next().is_none(),
                    Err(_) => false,
                };
                if !empty {
                    continue;
                }
                self.major("remove empty directory", &rel);
                fs::remove_dir(&path).map_err(io_err("remove", &path))?;
                outcome |= Outcome::FIXED_EXTRA;
                if let Some(parent) = parent_of(&rel) {
                    next.insert(parent);
                }
            }
            if next.is_empty() {
                return Ok(outcome);
            }
            self.candidates = next;
        }
    }

    fn major(&self, action: &str, rel: &Path) {
        if self.task.contains(Task::VERBOSE_MAJOR) {
            info!(action, path = %rel.display(), "apply");
        } else {
            debug!(action, path = %rel.display(), "apply");
        }
    }

    fn minor(&self, finding: &str, rel: &Path) {
        if self.task.contains(Task::VERBOSE_MINOR) {
            info!(finding, path = %rel.display(), "drift");
        } else {
            debug!(finding, path = %rel.display(), "drift");
        }
    }
}

/// Parent of a root-relative path, excluding the root itself.
fn parent_of(rel: &Path) -> Option<PathBuf> {
    rel.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

fn random_suffix() -> String {
    format!("{:08x}", rand::random::<u32>())
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> Option<u16> {
    use std::os::unix::fs::PermissionsExt;
    Some((meta.permissions().mode() & 0o7777) as u16)
}

#[cfg(not(unix))]
fn mode_of(_meta: &fs::Metadata) -> Option<u16> {
    None
}

#[cfg(unix)]
fn set_perms(path: &Path, perms: u16) -> ApplierResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(perms as u32)).map_err(io_err("chmod", path))
}

#[cfg(not(unix))]
fn set_perms(path: &Path, perms: u16) -> ApplierResult<()> {
    let mut permissions = fs::metadata(path).map_err(io_err("inspect", path))?.permissions();
    permissions.set_readonly(perms & 0o222 == 0);
    fs::set_permissions(path, permissions).map_err(io_err("chmod", path))
}

/// Sharing or busy errors that clear once another process lets go.
fn is_locked(err: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION / EBUSY, ETXTBSY
    let codes: &[i32] = if cfg!(windows) { &[32, 33] } else { &[16, 26] };
    err.raw_os_error().is_some_and(|code| codes.contains(&code))
}
