use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use aup_catalog::Catalog;
use aup_storage::Storage;
use tracing::{debug, error, info};

/// Name of the catalog blob inside a bundle and inside instance storage.
pub const CATALOG_KEY: &str = "catalog";

#[derive(Debug)]
struct Sighting {
    since: Instant,
    modified: Option<SystemTime>,
}

/// Debounced watcher over an import staging directory.
///
/// An entry becomes ready once it has stayed unmodified for the dwell
/// interval. Any change to its modification time restarts the wait.
#[derive(Debug)]
pub(crate) struct Importer {
    dir: PathBuf,
    dwell: Duration,
    found: BTreeMap<PathBuf, Sighting>,
    next_poll: Option<Instant>,
}

impl Importer {
    pub(crate) fn new(dir: PathBuf, dwell: Duration) -> Self {
        info!(dir = %dir.display(), dwell_secs = dwell.as_secs(), "importer armed");
        Self {
            dir,
            dwell,
            found: BTreeMap::new(),
            next_poll: None,
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// When the next poll is due. `None` means immediately.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.next_poll
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.next_poll.map_or(true, |due| now >= due)
    }

    /// Rescan the directory and return the entries whose dwell elapsed.
    pub(crate) fn poll(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut present = Vec::new();
        match fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let modified = entry.metadata().and_then(|m| m.modified()).ok();
                    present.push((entry.path(), modified));
                }
            }
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "failed to list import directory");
            }
        }

        self.found.retain(|path, _| present.iter().any(|(p, _)| p == path));
        for (path, modified) in present {
            match self.found.get_mut(&path) {
                Some(sighting) if sighting.modified != modified => {
                    debug!(path = %path.display(), "bundle still changing");
                    sighting.since = now;
                    sighting.modified = modified;
                }
                Some(_) => {}
                None => {
                    info!(path = %path.display(), "bundle found");
                    self.found.insert(path, Sighting { since: now, modified });
                }
            }
        }

        let dwell = self.dwell;
        let ready: Vec<PathBuf> = self
            .found
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.since) >= dwell)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &ready {
            self.found.remove(path);
        }

        let earliest = self.found.values().map(|s| s.since + dwell).min();
        let next = now + dwell;
        self.next_poll = Some(earliest.map_or(next, |e| e.min(next)));
        if ready.is_empty() {
            if let Some(e) = earliest {
                debug!(wait_ms = e.saturating_duration_since(now).as_millis() as u64, "waiting for bundles to settle");
            }
        }
        ready
    }
}

/// Open a ready bundle as a storage plus its decoded catalog. Entries that
/// are not bundles are logged and deleted.
pub(crate) fn open_bundle(path: &Path) -> Option<(Catalog, Storage)> {
    info!(path = %path.display(), "importing bundle");
    if !path.is_dir() {
        error!(path = %path.display(), "import entry is not a directory");
        discard(path);
        return None;
    }
    let storage = match Storage::open(path, false) {
        Ok(storage) => storage,
        Err(e) => {
            error!(path = %path.display(), error = %e, "unable to open bundle");
            discard(path);
            return None;
        }
    };
    let blob = match storage.get(CATALOG_KEY, 0, None) {
        Ok(Some(blob)) => blob,
        Ok(None) => {
            error!(path = %path.display(), "bundle has no catalog");
            discard(path);
            return None;
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "unable to read bundle catalog");
            discard(path);
            return None;
        }
    };
    match Catalog::from_bytes(&blob) {
        Ok(catalog) => Some((catalog, storage)),
        Err(e) => {
            error!(path = %path.display(), error = %e, "bad bundle catalog");
            discard(path);
            None
        }
    }
}

/// Remove an import entry, file or directory.
pub(crate) fn discard(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = result {
        error!(path = %path.display(), error = %e, "failed to remove import entry");
    }
}
