use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use aup_applier::{Applier, Outcome, Task};
use aup_catalog::{Catalog, Object};
use aup_storage::Storage;
use aup_types::{FileKind, Oid};
use tracing::{debug, error, info, warn};

use crate::config::InstanceConfig;
use crate::criteria::CriteriaSet;
use crate::error::{io_err, InstanceError, InstanceResult};
use crate::events::{Audience, EventFilter, EventStream, InstanceEvent, Notifier};
use crate::importer::{self, Importer, CATALOG_KEY};
use crate::index::{self, Index};

/// Counts from one garbage collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub catalog_dropped: usize,
    pub storage_dropped: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.catalog_dropped == 0 && self.storage_dropped == 0
    }
}

/// State that exists only between `start` and `stop`.
pub(crate) struct Running {
    pub(crate) config: InstanceConfig,
    pub(crate) target: CriteriaSet,
    pub(crate) buffer: CriteriaSet,
    pub(crate) catalog: Catalog,
    pub(crate) storage: Storage,
    pub(crate) index: Index,
    importer: Option<Importer>,
    save_due: Option<Instant>,
}

/// Update agent for one installation.
///
/// Keeps a catalog and a blob storage under the state directory, tracks
/// what the target and buffer audiences want, accepts objects from outside
/// and keeps the target directory in sync. Single-threaded: callers drive
/// timers through [`Instance::tick`].
pub struct Instance {
    running: Option<Running>,
    notifier: Notifier,
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl Instance {
    pub fn new() -> Self {
        Self {
            running: None,
            notifier: Notifier::new(InstanceConfig::default().event_capacity),
        }
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// Register an observer. Works before `start`.
    pub fn subscribe(&mut self, filter: EventFilter) -> EventStream {
        self.notifier.subscribe(filter)
    }

    pub fn subscriber_count(&self) -> usize {
        self.notifier.subscriber_count()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bind the state directory, load the catalog, build the index and arm
    /// the importer.
    pub fn start(&mut self, config: InstanceConfig) -> InstanceResult<()> {
        if self.running.is_some() {
            return Err(InstanceError::AlreadyStarted);
        }
        let target = CriteriaSet::parse(&config.target, &config.build_info)?;
        let buffer = CriteriaSet::parse(&config.buffer, &config.build_info)?;
        let storage = Storage::open(&config.state_dir, true)?;

        let importer = match &config.import_dir {
            Some(dir) if dir.is_dir() => Some(Importer::new(dir.clone(), config.import_dwell())),
            Some(dir) => {
                warn!(dir = %dir.display(), "import directory missing, importer disabled");
                None
            }
            None => None,
        };

        info!(
            state_dir = %config.state_dir.display(),
            target_dir = %config.target_dir.display(),
            target_criteria = target.len(),
            buffer_criteria = buffer.len(),
            "instance starting"
        );
        self.notifier.set_capacity(config.event_capacity);
        self.running = Some(Running {
            config,
            target,
            buffer,
            catalog: Catalog::new(),
            storage,
            index: Index::default(),
            importer,
            save_due: None,
        });
        self.load_catalog()
    }

    /// Flush an unsaved catalog and release all state.
    pub fn stop(&mut self) -> InstanceResult<()> {
        if self.running.is_none() {
            return Ok(());
        }
        let saved = self.save_catalog(false);
        self.running = None;
        info!("instance stopped");
        saved
    }

    pub(crate) fn running(&self) -> InstanceResult<&Running> {
        self.running.as_ref().ok_or(InstanceError::NotStarted)
    }

    pub(crate) fn running_mut(&mut self) -> InstanceResult<&mut Running> {
        self.running.as_mut().ok_or(InstanceError::NotStarted)
    }

    // -----------------------------------------------------------------------
    // Index
    // -----------------------------------------------------------------------

    pub fn index(&self) -> InstanceResult<&Index> {
        Ok(&self.running()?.index)
    }

    pub fn config(&self) -> InstanceResult<&InstanceConfig> {
        Ok(&self.running()?.config)
    }

    pub fn catalog(&self) -> InstanceResult<&Catalog> {
        Ok(&self.running()?.catalog)
    }

    pub fn storage(&self) -> InstanceResult<&Storage> {
        Ok(&self.running()?.storage)
    }

    /// Nothing the target wants is missing.
    pub fn target_complete(&self) -> InstanceResult<bool> {
        Ok(self.running()?.index.target.is_complete())
    }

    /// Rebuild the index from scratch and publish what changed.
    pub fn update_index(&mut self) -> InstanceResult<()> {
        let events = self.running_mut()?.rebuild_index()?;
        self.publish(events)
    }

    /// Drop every catalog object and blob no audience needs.
    pub fn collect_garbage(&mut self) -> InstanceResult<GcReport> {
        let running = self.running_mut()?;
        let (required_catalog, required_storage) = {
            let (target, buffer) = (&running.target, &running.buffer);
            index::collect_required(&running.catalog, &running.index.all_releases, |object| {
                target.matches(object) || buffer.matches(object)
            })
        };

        let report = GcReport {
            storage_dropped: running.storage.drop_others_than(&required_storage)?,
            catalog_dropped: running.catalog.drop_others_than(&required_catalog),
        };
        if report.storage_dropped > 0 {
            info!(dropped = report.storage_dropped, "dropped garbage from storage");
        }
        if report.catalog_dropped > 0 {
            info!(dropped = report.catalog_dropped, "dropped garbage from catalog");
            running.catalog_changed(Instant::now());
        }
        self.update_index()?;
        Ok(report)
    }

    /// Applier roots for the target: every selected unit of every target
    /// most recent release, with the kinds its criteria allow.
    pub fn target_roots(&self) -> InstanceResult<BTreeMap<Oid, BTreeSet<FileKind>>> {
        let running = self.running()?;
        let mut roots: BTreeMap<Oid, BTreeSet<FileKind>> = BTreeMap::new();
        for release_oid in &running.index.target.most_releases {
            let Some(Object::Release(release)) = running.catalog.get_ref(release_oid) else {
                continue;
            };
            log_release("release for target update", release_oid, release);
            for unit_oid in &release.dependencies {
                let Some(Object::Unit(unit)) = running.catalog.get_ref(unit_oid) else {
                    continue;
                };
                if running.target.matches_unit(unit) {
                    roots
                        .entry(*unit_oid)
                        .or_default()
                        .extend(running.target.unit_kinds(unit));
                }
            }
        }
        Ok(roots)
    }

    /// Reconcile the target directory and publish the outcome.
    pub fn update_target(&mut self) -> InstanceResult<Outcome> {
        let roots = self.target_roots()?;
        let running = self.running()?;
        let target_dir = &running.config.target_dir;
        fs::create_dir_all(target_dir).map_err(io_err("create", target_dir))?;

        let mut applier = Applier::new();
        applier.add_catalog(&running.catalog).add_storage(&running.storage);
        for (oid, kinds) in roots {
            applier.add_root(oid, kinds);
        }
        let outcome = applier.process(
            target_dir,
            Task::VERBOSE
                | Task::REMOVE_WRONGS
                | Task::EMPLACE_MISSINGS
                | Task::EMPLACE_CHANGES
                | Task::REMOVE_EXTRA,
        )?;
        info!(target_dir = %target_dir.display(), %outcome, "target updated");
        self.notifier.emit(InstanceEvent::TargetUpdated(outcome));
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Read the persisted catalog. Releases with bad signatures are dropped.
    /// A missing or unreadable catalog leaves the current one empty.
    pub fn load_catalog(&mut self) -> InstanceResult<()> {
        let running = self.running_mut()?;
        running.catalog.clear();
        match running.storage.get(CATALOG_KEY, 0, None) {
            Ok(Some(blob)) => {
                if let Err(e) = running.catalog.deserialize(&blob) {
                    warn!(error = %e, "unable to load catalog");
                    running.catalog.clear();
                }
            }
            Ok(None) => debug!("no persisted catalog"),
            Err(e) => warn!(error = %e, "unable to read catalog"),
        }

        let bad: Vec<Oid> = running
            .catalog
            .iter()
            .filter(|(_, object)| !object.verify_signature())
            .map(|(oid, _)| *oid)
            .collect();
        if !bad.is_empty() {
            for oid in &bad {
                warn!(oid = %oid.short_hex(), "dropping release with bad signature");
                running.catalog.del(oid);
            }
            running.catalog_changed(Instant::now());
        }
        info!(objects = running.catalog.len(), "catalog loaded");
        self.update_index()
    }

    /// Persist the catalog. Without `force` nothing happens unless a change
    /// is pending.
    pub fn save_catalog(&mut self, force: bool) -> InstanceResult<()> {
        let running = self.running_mut()?;
        if !force && !running.save_pending() {
            return Ok(());
        }
        running.save_due = None;
        running.storage.put(CATALOG_KEY, &running.catalog.serialize())?;
        debug!(objects = running.catalog.len(), "catalog saved");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Run whatever timers are due at `now`.
    pub fn tick(&mut self, now: Instant) -> InstanceResult<()> {
        let running = self.running_mut()?;
        if running.save_due.is_some_and(|due| now >= due) {
            if let Err(e) = self.save_catalog(false) {
                warn!(error = %e, "unable to save catalog");
            }
        }

        let running = self.running_mut()?;
        let ready = match running.importer.as_mut() {
            Some(importer) if importer.is_due(now) => importer.poll(now),
            _ => Vec::new(),
        };
        if !ready.is_empty() {
            self.import_bundles(&ready)?;
        }
        Ok(())
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let running = self.running.as_ref()?;
        let importer = running.importer.as_ref().map(|i| i.next_deadline());
        match (running.save_due, importer) {
            (Some(save), Some(Some(poll))) => Some(save.min(poll)),
            (Some(save), _) => Some(save),
            (None, Some(Some(poll))) => Some(poll),
            (None, Some(None)) => Some(Instant::now()),
            (None, None) => None,
        }
    }

    pub fn import_dir(&self) -> Option<PathBuf> {
        self.running
            .as_ref()?
            .importer
            .as_ref()
            .map(|i| i.dir().to_path_buf())
    }

    /// Merge ready bundles, then rebuild, collect garbage and save.
    fn import_bundles(&mut self, ready: &[PathBuf]) -> InstanceResult<()> {
        let running = self.running_mut()?;
        for path in ready {
            let Some((bundle_catalog, bundle_storage)) = importer::open_bundle(path) else {
                continue;
            };
            let accepted = running.catalog.import(bundle_catalog, |oid, object| {
                let valid = object.verify_signature();
                if !valid {
                    warn!(oid = %oid.short_hex(), "bundle release has bad signature, skipped");
                }
                valid
            });
            running.catalog_changed(Instant::now());
            match running.storage.import(&bundle_storage) {
                Ok(moved) => {
                    info!(path = %path.display(), objects = accepted, blobs = moved, "bundle imported");
                    importer::discard(path);
                }
                // Left in place for the next poll.
                Err(e) => error!(path = %path.display(), error = %e, "failed to move bundle blobs"),
            }
        }
        self.update_index()?;
        self.collect_garbage()?;
        self.save_catalog(false)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Emit events for a committed index change. A totally complete target
    /// also flushes the catalog.
    pub(crate) fn publish(&mut self, events: Vec<InstanceEvent>) -> InstanceResult<()> {
        let target_done = events.contains(&InstanceEvent::TotallyComplete {
            audience: Audience::Target,
        });
        if let Some(running) = self.running.as_ref() {
            for event in &events {
                match event {
                    InstanceEvent::NewReleaseFound(oid) => {
                        if let Some(Object::Release(r)) = running.catalog.get_ref(oid) {
                            log_release("new release found", oid, r);
                        }
                    }
                    InstanceEvent::MostReleases { audience, releases } => {
                        info!(%audience, releases = releases.len(), "most recent releases changed");
                    }
                    InstanceEvent::TotallyComplete { audience } => {
                        info!(%audience, "totally complete");
                    }
                    _ => {}
                }
            }
        }
        if target_done {
            if let Err(e) = self.save_catalog(false) {
                warn!(error = %e, "unable to save catalog");
            }
        }
        for event in events {
            self.notifier.emit(event);
        }
        Ok(())
    }
}

impl Running {
    pub(crate) fn rebuild_index(&mut self) -> InstanceResult<Vec<InstanceEvent>> {
        let next = Index::build(&self.catalog, &self.storage, &self.target, &self.buffer)?;
        let events = next.changes_since(&self.index);
        self.index = next;
        Ok(events)
    }

    /// Schedule a write-back unless one is already pending.
    pub(crate) fn catalog_changed(&mut self, now: Instant) {
        if self.save_due.is_none() {
            let interval: Duration = self.config.catalog_save_interval();
            self.save_due = Some(now + interval);
        }
    }

    pub(crate) fn save_pending(&self) -> bool {
        self.save_due.is_some()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "failed to stop instance cleanly");
        }
    }
}

fn log_release(what: &str, oid: &Oid, release: &aup_catalog::Release) {
    info!(
        oid = %oid.short_hex(),
        branch = %release.src_branch,
        revision = %release.src_revision,
        moment = release.src_moment,
        os = %release.platform_os,
        arch = %release.platform_arch,
        compiler = %release.compiler,
        compiler_version = %release.compiler_version,
        optimization = %release.compiler_optimization,
        provider = %release.provider,
        stability = release.stability,
        signer = %hex::encode(release.signer),
        "{what}"
    );
}
