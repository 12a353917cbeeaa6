use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use aup_types::Oid;
use tracing::{debug, warn};

use crate::error::{io_err, StorageError, StorageResult};
use crate::key::StorageKey;

/// Directory-backed blob store.
///
/// Content blobs live at `<root>/<hex byte 0>/<hex bytes 1..31>`; named blobs
/// (such as the persisted catalog) live at their own path under the root.
/// With `auto_fix` set, malformed entries are deleted instead of reported.
#[derive(Debug, Default)]
pub struct Storage {
    root: Option<PathBuf>,
    auto_fix: bool,
}

impl Storage {
    /// An unbound storage. Every lookup misses and every write fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to `root`, creating it if needed.
    pub fn open(root: impl Into<PathBuf>, auto_fix: bool) -> StorageResult<Self> {
        let mut storage = Self::new();
        storage.reset(Some(root.into()), auto_fix)?;
        Ok(storage)
    }

    /// Rebind the root. `None` unbinds.
    pub fn reset(&mut self, root: Option<PathBuf>, auto_fix: bool) -> StorageResult<()> {
        self.root = None;
        self.auto_fix = auto_fix;
        let Some(root) = root else {
            return Ok(());
        };
        match fs::symlink_metadata(&root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) if auto_fix => {
                warn!(path = %root.display(), "storage root is not a directory, replacing");
                fs::remove_file(&root).map_err(io_err("remove", &root))?;
            }
            Ok(_) => return Err(StorageError::Malformed(root)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("inspect", &root)(e)),
        }
        fs::create_dir_all(&root).map_err(io_err("create", &root))?;
        self.root = Some(root);
        Ok(())
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn auto_fix(&self) -> bool {
        self.auto_fix
    }

    /// Filesystem path of a key, if the storage is bound and the key valid.
    pub fn path_of(&self, key: &StorageKey) -> Option<PathBuf> {
        key.resolve(self.root.as_deref()?)
    }

    fn require_path(&self, key: &StorageKey) -> StorageResult<PathBuf> {
        let root = self.root.as_deref().ok_or(StorageError::Unbound)?;
        key.resolve(root)
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))
    }

    // -----------------------------------------------------------------------
    // Blob access
    // -----------------------------------------------------------------------

    /// Store bytes under `key`, replacing any previous blob atomically.
    pub fn put(&self, key: impl Into<StorageKey>, data: &[u8]) -> StorageResult<()> {
        self.put_reader(key, data).map(|_| ())
    }

    /// Stream a reader into `key`. Returns the number of bytes written.
    pub fn put_reader<R: Read>(&self, key: impl Into<StorageKey>, mut reader: R) -> StorageResult<u64> {
        let key = key.into();
        let path = self.require_path(&key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        self.clear_non_file(&path)?;
        fs::create_dir_all(parent).map_err(io_err("create", parent))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err("create temp in", parent))?;
        let written = io::copy(&mut reader, &mut tmp).map_err(io_err("write", tmp.path()))?;
        tmp.as_file_mut().flush().map_err(io_err("flush", &path))?;
        tmp.persist(&path)
            .map_err(|e| io_err("move into place", &path)(e.error))?;
        debug!(key = %key, bytes = written, "stored blob");
        Ok(written)
    }

    /// Whether a regular file exists for `key`.
    pub fn has(&self, key: impl Into<StorageKey>) -> StorageResult<bool> {
        let Some(path) = self.path_of(&key.into()) else {
            return Ok(false);
        };
        self.check_file(&path)
    }

    /// Read up to `len` bytes starting at `offset`; `None` reads to the end.
    /// Returns `None` if the blob is absent.
    pub fn get(
        &self,
        key: impl Into<StorageKey>,
        offset: u64,
        len: Option<u64>,
    ) -> StorageResult<Option<Vec<u8>>> {
        let Some(path) = self.path_of(&key.into()) else {
            return Ok(None);
        };
        if !self.check_file(&path)? {
            return Ok(None);
        }
        match Self::read_range(&path, offset, len) {
            Ok(data) => Ok(Some(data)),
            Err(e) if self.auto_fix => {
                warn!(path = %path.display(), error = %e, "unreadable blob, deleting");
                self.remove_entry(&path)?;
                Ok(None)
            }
            Err(e) => Err(io_err("read", &path)(e)),
        }
    }

    /// Open a blob for streaming reads.
    pub fn open_reader(&self, key: impl Into<StorageKey>) -> StorageResult<Option<fs::File>> {
        let Some(path) = self.path_of(&key.into()) else {
            return Ok(None);
        };
        if !self.check_file(&path)? {
            return Ok(None);
        }
        fs::File::open(&path).map(Some).map_err(io_err("open", &path))
    }

    /// Remove a blob and any ancestor directories it leaves empty.
    pub fn del(&self, key: impl Into<StorageKey>) -> StorageResult<bool> {
        let Some(path) = self.path_of(&key.into()) else {
            return Ok(false);
        };
        if fs::symlink_metadata(&path).is_err() {
            return Ok(false);
        }
        self.remove_entry(&path)?;
        self.prune_ancestors(&path);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    /// Every content blob in the store.
    ///
    /// Top-level files are named blobs and are skipped. Anything inside a
    /// shard directory that does not decode to an Oid is stray.
    pub fn enumerate(&self) -> StorageResult<BTreeSet<Oid>> {
        let mut found = BTreeSet::new();
        let Some(root) = self.root.as_deref() else {
            return Ok(found);
        };
        let mut strays = Vec::new();
        for entry in walkdir::WalkDir::new(root).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if self.auto_fix => {
                    warn!(error = %e, "skipping unreadable storage entry");
                    continue;
                }
                Err(e) => {
                    let path = e.path().unwrap_or(root).to_path_buf();
                    return Err(io_err("walk", path)(io::Error::from(e)));
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let parts: Vec<&str> = rel.iter().filter_map(|p| p.to_str()).collect();
            if parts.len() == 1 || !parts.first().is_some_and(|p| is_shard(p)) {
                continue;
            }
            match decode_blob_path(&parts) {
                Some(oid) if entry.file_type().is_file() => {
                    found.insert(oid);
                }
                _ => strays.push(entry.into_path()),
            }
        }
        for stray in strays {
            if !self.auto_fix {
                return Err(StorageError::Malformed(stray));
            }
            warn!(path = %stray.display(), "deleting stray storage entry");
            self.remove_entry(&stray)?;
            self.prune_ancestors(&stray);
        }
        Ok(found)
    }

    /// Delete every blob. With `and_root` the root directory goes too and
    /// the storage becomes unbound.
    pub fn del_all(&mut self, and_root: bool) -> StorageResult<()> {
        let Some(root) = self.root.clone() else {
            return Ok(());
        };
        if and_root {
            fs::remove_dir_all(&root).map_err(io_err("remove", &root))?;
            self.root = None;
            return Ok(());
        }
        for entry in fs::read_dir(&root).map_err(io_err("list", &root))? {
            let entry = entry.map_err(io_err("list", &root))?;
            self.remove_entry(&entry.path())?;
        }
        Ok(())
    }

    /// Move every content blob of `other` into this store. Blobs already
    /// present here are left in `other`. Returns the number of blobs moved.
    pub fn import(&self, other: &Storage) -> StorageResult<usize> {
        let mut moved = 0;
        for oid in other.enumerate()? {
            if self.has(oid)? {
                continue;
            }
            let key = StorageKey::Oid(oid);
            let (Some(src), Ok(dst)) = (other.path_of(&key), self.require_path(&key)) else {
                continue;
            };
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(io_err("create", parent))?;
            }
            if fs::rename(&src, &dst).is_err() {
                // Different filesystems: fall back to copy and delete.
                fs::copy(&src, &dst).map_err(io_err("copy", &src))?;
                fs::remove_file(&src).map_err(io_err("remove", &src))?;
            }
            other.prune_ancestors(&src);
            moved += 1;
        }
        debug!(moved, "imported blobs");
        Ok(moved)
    }

    /// Delete every content blob not in `keep`. Returns the number deleted.
    pub fn drop_others_than(&self, keep: &BTreeSet<Oid>) -> StorageResult<usize> {
        let mut dropped = 0;
        for oid in self.enumerate()? {
            if !keep.contains(&oid) && self.del(oid)? {
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// `Ok(true)` for a regular file, `Ok(false)` when absent. Anything else
    /// is deleted under auto-fix or reported as malformed.
    fn check_file(&self, path: &Path) -> StorageResult<bool> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_file() => Ok(true),
            Ok(_) => {
                self.clear_non_file(path)?;
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) if self.auto_fix => {
                warn!(path = %path.display(), error = %e, "uninspectable blob, deleting");
                self.remove_entry(path)?;
                Ok(false)
            }
            Err(e) => Err(io_err("inspect", path)(e)),
        }
    }

    fn clear_non_file(&self, path: &Path) -> StorageResult<()> {
        match fs::symlink_metadata(path) {
            Ok(meta) if !meta.is_file() => {
                if !self.auto_fix {
                    return Err(StorageError::Malformed(path.to_path_buf()));
                }
                warn!(path = %path.display(), "blob path is not a regular file, deleting");
                self.remove_entry(path)
            }
            _ => Ok(()),
        }
    }

    fn read_range(path: &Path, offset: u64, len: Option<u64>) -> io::Result<Vec<u8>> {
        let mut file = fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::new();
        match len {
            Some(len) => file.take(len).read_to_end(&mut data)?,
            None => file.read_to_end(&mut data)?,
        };
        Ok(data)
    }

    fn remove_entry(&self, path: &Path) -> StorageResult<()> {
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(io_err("remove", path))
    }

    /// Remove empty directories from `path`'s parent up to, not including,
    /// the root. Best effort.
    fn prune_ancestors(&self, path: &Path) {
        let Some(root) = self.root.as_deref() else {
            return;
        };
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == root || !current.starts_with(root) {
                break;
            }
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }
}

fn is_shard(part: &str) -> bool {
    part.len() == 2 && part.bytes().all(|b| b.is_ascii_hexdigit())
}

fn decode_blob_path(parts: &[&str]) -> Option<Oid> {
    let [shard, rest] = parts else {
        return None;
    };
    if rest.len() != 62 || !is_lower_hex(shard) || !is_lower_hex(rest) {
        return None;
    }
    Oid::from_hex(&format!("{shard}{rest}")).ok()
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aup_crypto::identify;

    fn open() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("store"), true).unwrap();
        (dir, storage)
    }

    // -----------------------------------------------------------------------
    // Blob access
    // -----------------------------------------------------------------------

    #[test]
    fn put_get_has() {
        let (_dir, s) = open();
        let oid = identify(b"hello world");
        assert!(!s.has(oid).unwrap());
        s.put(oid, b"hello world").unwrap();
        assert!(s.has(oid).unwrap());
        assert_eq!(s.get(oid, 0, None).unwrap().unwrap(), b"hello world");
    }

    #[test]
    fn get_partial_range() {
        let (_dir, s) = open();
        s.put("named", b"0123456789").unwrap();
        assert_eq!(s.get("named", 2, Some(3)).unwrap().unwrap(), b"234");
        assert_eq!(s.get("named", 8, Some(10)).unwrap().unwrap(), b"89");
        assert_eq!(s.get("named", 20, None).unwrap().unwrap(), b"");
    }

    #[test]
    fn put_reader_streams() {
        let (_dir, s) = open();
        let data = vec![7u8; 100_000];
        let oid = identify(&data);
        assert_eq!(s.put_reader(oid, io::Cursor::new(&data)).unwrap(), 100_000);
        let reader = s.open_reader(oid).unwrap().unwrap();
        assert_eq!(aup_crypto::identify_reader(reader).unwrap(), oid);
    }

    #[test]
    fn del_prunes_empty_shard_directory() {
        let (_dir, s) = open();
        let oid = identify(b"x");
        s.put(oid, b"x").unwrap();
        let shard = s.path_of(&oid.into()).unwrap().parent().unwrap().to_path_buf();
        assert!(shard.is_dir());
        assert!(s.del(oid).unwrap());
        assert!(!shard.exists());
        assert!(s.root().unwrap().is_dir());
        assert!(!s.del(oid).unwrap());
    }

    #[test]
    fn escaping_names_are_rejected() {
        let (_dir, s) = open();
        assert!(matches!(
            s.put("../outside", b"x"),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(!s.has("../outside").unwrap());
        assert!(s.get("/etc/passwd", 0, None).unwrap().is_none());
    }

    #[test]
    fn unbound_storage_misses() {
        let s = Storage::new();
        let oid = identify(b"x");
        assert!(!s.has(oid).unwrap());
        assert!(s.enumerate().unwrap().is_empty());
        assert!(matches!(s.put(oid, b"x"), Err(StorageError::Unbound)));
    }

    #[test]
    fn directory_at_blob_path_is_fixed_or_reported() {
        let (dir, s) = open();
        let oid = identify(b"x");
        let path = s.path_of(&oid.into()).unwrap();
        fs::create_dir_all(&path).unwrap();
        assert!(!s.has(oid).unwrap());
        assert!(!path.exists());

        let strict = Storage::open(dir.path().join("strict"), false).unwrap();
        let path = strict.path_of(&oid.into()).unwrap();
        fs::create_dir_all(&path).unwrap();
        assert!(matches!(strict.has(oid), Err(StorageError::Malformed(_))));
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    #[test]
    fn enumerate_skips_named_and_deletes_strays() {
        let (_dir, s) = open();
        let a = identify(b"a");
        let b = identify(b"b");
        s.put(a, b"a").unwrap();
        s.put(b, b"b").unwrap();
        s.put("catalog", b"cat").unwrap();
        let root = s.root().unwrap().to_path_buf();
        fs::create_dir_all(root.join("ab")).unwrap();
        fs::write(root.join("ab").join("not-an-oid"), b"junk").unwrap();

        let found = s.enumerate().unwrap();
        assert_eq!(found, [a, b].into_iter().collect());
        assert!(!root.join("ab").join("not-an-oid").exists());
        assert!(s.has("catalog").unwrap());
    }

    #[test]
    fn enumerate_without_auto_fix_reports_strays() {
        let dir = tempfile::tempdir().unwrap();
        let s = Storage::open(dir.path(), false).unwrap();
        fs::create_dir_all(dir.path().join("0f")).unwrap();
        fs::write(dir.path().join("0f").join("junk"), b"").unwrap();
        assert!(matches!(s.enumerate(), Err(StorageError::Malformed(_))));
    }

    #[test]
    fn drop_others_than_keeps_listed() {
        let (_dir, s) = open();
        let keep = identify(b"keep");
        let gone = identify(b"gone");
        s.put(keep, b"keep").unwrap();
        s.put(gone, b"gone").unwrap();
        let set = [keep].into_iter().collect();
        assert_eq!(s.drop_others_than(&set).unwrap(), 1);
        assert_eq!(s.drop_others_than(&set).unwrap(), 0);
        assert_eq!(s.enumerate().unwrap(), set);
    }

    #[test]
    fn import_moves_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let main = Storage::open(dir.path().join("main"), true).unwrap();
        let bundle = Storage::open(dir.path().join("bundle"), false).unwrap();
        let oid = identify(b"payload");
        bundle.put(oid, b"payload").unwrap();
        bundle.put("catalog", b"cat").unwrap();

        assert_eq!(main.import(&bundle).unwrap(), 1);
        assert!(main.has(oid).unwrap());
        assert!(!bundle.has(oid).unwrap());
        assert!(bundle.has("catalog").unwrap());
    }

    #[test]
    fn import_keeps_present_blob() {
        let dir = tempfile::tempdir().unwrap();
        let main = Storage::open(dir.path().join("main"), true).unwrap();
        let bundle = Storage::open(dir.path().join("bundle"), false).unwrap();
        let oid = identify(b"good content");
        main.put(oid, b"good content").unwrap();
        bundle.put(oid, b"garbage bytes").unwrap();

        assert_eq!(main.import(&bundle).unwrap(), 0);
        assert_eq!(main.get(oid, 0, None).unwrap().unwrap(), b"good content");
        assert!(bundle.has(oid).unwrap());
    }

    #[test]
    fn del_all_empties_root() {
        let (_dir, mut s) = open();
        s.put(identify(b"a"), b"a").unwrap();
        s.put("catalog", b"c").unwrap();
        s.del_all(false).unwrap();
        assert!(s.enumerate().unwrap().is_empty());
        assert!(!s.has("catalog").unwrap());
        let root = s.root().unwrap().to_path_buf();
        s.del_all(true).unwrap();
        assert!(!root.exists());
        assert!(s.root().is_none());
    }

    #[test]
    fn reset_replaces_file_root_under_auto_fix() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        fs::write(&root, b"not a dir").unwrap();
        let mut s = Storage::new();
        assert!(matches!(
            s.reset(Some(root.clone()), false),
            Err(StorageError::Malformed(_))
        ));
        s.reset(Some(root.clone()), true).unwrap();
        assert!(root.is_dir());
    }
}
