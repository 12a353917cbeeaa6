//! Per-audience completeness index.
//!
//! The index is derived from the catalog, the storage and the criteria. It
//! is never persisted. A full [`Index::build`] recomputes everything; the
//! `*_arrived` methods patch it after a single object lands and return only
//! the transitions that patch caused.

use std::collections::{BTreeMap, BTreeSet};

use aup_catalog::{Catalog, Object, ObjectType};
use aup_storage::{Storage, StorageResult};
use aup_types::Oid;

use crate::criteria::CriteriaSet;
use crate::events::{Audience, InstanceEvent};

/// What one audience wants and how much of it is present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudienceIndex {
    /// Latest release per (branch, os, arch, provider, signer).
    pub most_releases: BTreeSet<Oid>,
    pub catalog_incomplete: BTreeSet<Oid>,
    pub catalog_complete: BTreeSet<Oid>,
    pub storage_incomplete: BTreeSet<Oid>,
    pub storage_complete: BTreeSet<Oid>,
}

impl AudienceIndex {
    /// Nothing wanted is missing.
    pub fn is_complete(&self) -> bool {
        self.catalog_incomplete.is_empty() && self.storage_incomplete.is_empty()
    }

    /// Merge `delta` in. Returns the members that were not present before.
    fn absorb(&mut self, delta: AudienceIndex) -> AudienceIndex {
        fn fresh(into: &mut BTreeSet<Oid>, from: BTreeSet<Oid>) -> BTreeSet<Oid> {
            from.into_iter().filter(|oid| into.insert(*oid)).collect()
        }
        AudienceIndex {
            most_releases: BTreeSet::new(),
            catalog_incomplete: fresh(&mut self.catalog_incomplete, delta.catalog_incomplete),
            catalog_complete: fresh(&mut self.catalog_complete, delta.catalog_complete),
            storage_incomplete: fresh(&mut self.storage_incomplete, delta.storage_incomplete),
            storage_complete: fresh(&mut self.storage_complete, delta.storage_complete),
        }
    }
}

/// Snapshot of both audiences plus every known release.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Index {
    pub all_releases: BTreeSet<Oid>,
    pub target: AudienceIndex,
    pub buffer: AudienceIndex,
}

impl Index {
    pub fn audience(&self, audience: Audience) -> &AudienceIndex {
        match audience {
            Audience::Target => &self.target,
            Audience::Buffer => &self.buffer,
        }
    }

    fn audience_mut(&mut self, audience: Audience) -> &mut AudienceIndex {
        match audience {
            Audience::Target => &mut self.target,
            Audience::Buffer => &mut self.buffer,
        }
    }

    /// Whether `oid` is a wanted, absent catalog object for either audience.
    pub fn wants_catalog(&self, oid: &Oid) -> bool {
        self.target.catalog_incomplete.contains(oid) || self.buffer.catalog_incomplete.contains(oid)
    }

    /// Whether `oid` is a wanted, absent blob for either audience.
    pub fn wants_storage(&self, oid: &Oid) -> bool {
        self.target.storage_incomplete.contains(oid) || self.buffer.storage_incomplete.contains(oid)
    }

    /// Recompute from scratch.
    pub(crate) fn build(
        catalog: &Catalog,
        storage: &Storage,
        target: &CriteriaSet,
        buffer: &CriteriaSet,
    ) -> StorageResult<Self> {
        let mut index = Index {
            all_releases: catalog.enumerate(Some(ObjectType::Release)),
            ..Default::default()
        };
        for (audience, criteria) in [(Audience::Target, target), (Audience::Buffer, buffer)] {
            let most = most_recent_releases(catalog, criteria, &index.all_releases);
            let out = index.audience_mut(audience);
            for oid in &most {
                collect_objects(catalog, storage, criteria, *oid, out, None)?;
            }
            out.most_releases = most;
        }
        Ok(index)
    }

    /// Patch after a wanted catalog object was stored.
    pub(crate) fn catalog_object_arrived(
        &mut self,
        catalog: &Catalog,
        storage: &Storage,
        criteria: [&CriteriaSet; 2],
        oid: Oid,
    ) -> StorageResult<Vec<InstanceEvent>> {
        let mut events = Vec::new();
        let Some(object) = catalog.get_ref(&oid) else {
            return Ok(events);
        };
        for (audience, criteria) in Audience::BOTH.into_iter().zip(criteria) {
            let current = self.audience_mut(audience);
            if !current.catalog_incomplete.remove(&oid) {
                continue;
            }
            let mut delta = AudienceIndex::default();
            if criteria.matches(object) {
                collect_objects(
                    catalog,
                    storage,
                    criteria,
                    oid,
                    &mut delta,
                    Some(&current.catalog_complete),
                )?;
            } else {
                delta.catalog_complete.insert(oid);
            }
            let fresh = current.absorb(delta);
            let changed = !fresh.catalog_complete.is_empty() || !fresh.storage_complete.is_empty();
            push_set_events(audience, &fresh, &mut events);
            if changed && current.is_complete() {
                events.push(InstanceEvent::TotallyComplete { audience });
            }
        }
        Ok(events)
    }

    /// Patch after a wanted blob was stored.
    pub(crate) fn storage_object_arrived(&mut self, oid: Oid) -> Vec<InstanceEvent> {
        let mut events = Vec::new();
        for audience in Audience::BOTH {
            let current = self.audience_mut(audience);
            if !current.storage_incomplete.remove(&oid) {
                continue;
            }
            current.storage_complete.insert(oid);
            events.push(InstanceEvent::StorageComplete { audience, oid });
            if current.is_complete() {
                events.push(InstanceEvent::TotallyComplete { audience });
            }
        }
        events
    }

    /// Transitions from `prev` to `self`, in emission order.
    pub(crate) fn changes_since(&self, prev: &Index) -> Vec<InstanceEvent> {
        let mut events: Vec<InstanceEvent> = self
            .all_releases
            .difference(&prev.all_releases)
            .map(|oid| InstanceEvent::NewReleaseFound(*oid))
            .collect();

        for audience in Audience::BOTH {
            let (now, before) = (self.audience(audience), prev.audience(audience));
            let mut changed = false;
            if now.most_releases != before.most_releases {
                changed = true;
                events.push(InstanceEvent::MostReleases {
                    audience,
                    releases: now.most_releases.clone(),
                });
            }
            let fresh = AudienceIndex {
                most_releases: BTreeSet::new(),
                catalog_incomplete: added(&now.catalog_incomplete, &before.catalog_incomplete),
                catalog_complete: added(&now.catalog_complete, &before.catalog_complete),
                storage_incomplete: added(&now.storage_incomplete, &before.storage_incomplete),
                storage_complete: added(&now.storage_complete, &before.storage_complete),
            };
            changed |= !fresh.catalog_complete.is_empty() || !fresh.storage_complete.is_empty();
            push_set_events(audience, &fresh, &mut events);
            if changed && now.is_complete() {
                events.push(InstanceEvent::TotallyComplete { audience });
            }
        }
        events
    }
}

fn added(now: &BTreeSet<Oid>, before: &BTreeSet<Oid>) -> BTreeSet<Oid> {
    now.difference(before).copied().collect()
}

fn push_set_events(audience: Audience, fresh: &AudienceIndex, events: &mut Vec<InstanceEvent>) {
    let groups: [(&BTreeSet<Oid>, fn(Audience, Oid) -> InstanceEvent); 4] = [
        (&fresh.catalog_incomplete, |audience, oid| InstanceEvent::CatalogIncomplete { audience, oid }),
        (&fresh.catalog_complete, |audience, oid| InstanceEvent::CatalogComplete { audience, oid }),
        (&fresh.storage_incomplete, |audience, oid| InstanceEvent::StorageIncomplete { audience, oid }),
        (&fresh.storage_complete, |audience, oid| InstanceEvent::StorageComplete { audience, oid }),
    ];
    for (set, make) in groups {
        events.extend(set.iter().map(|oid| make(audience, *oid)));
    }
}

// ---------------------------------------------------------------------------
// Graph walks
// ---------------------------------------------------------------------------

/// The newest matching release per (branch, os, arch, provider, signer).
pub(crate) fn most_recent_releases(
    catalog: &Catalog,
    criteria: &CriteriaSet,
    releases: &BTreeSet<Oid>,
) -> BTreeSet<Oid> {
    type Key<'a> = (&'a str, &'a str, &'a str, &'a str, [u8; 32]);
    let mut newest: BTreeMap<Key<'_>, (u64, Oid)> = BTreeMap::new();

    for oid in releases {
        let Some(Object::Release(release)) = catalog.get_ref(oid) else {
            continue;
        };
        if !criteria.matches_release(release) {
            continue;
        }
        let key = (
            release.src_branch.as_str(),
            release.platform_os.as_str(),
            release.platform_arch.as_str(),
            release.provider.as_str(),
            release.signer,
        );
        newest
            .entry(key)
            .and_modify(|slot| {
                if slot.0 < release.src_moment {
                    *slot = (release.src_moment, *oid);
                }
            })
            .or_insert((release.src_moment, *oid));
    }
    newest.into_values().map(|(_, oid)| oid).collect()
}

/// Classify everything reachable from the present, matching object `root`.
///
/// Absent dependencies become catalog-incomplete. Present dependencies the
/// criteria rejects are complete and not descended into. Objects listed in
/// `known_complete` are skipped with their subtrees.
pub(crate) fn collect_objects(
    catalog: &Catalog,
    storage: &Storage,
    criteria: &CriteriaSet,
    root: Oid,
    out: &mut AudienceIndex,
    known_complete: Option<&BTreeSet<Oid>>,
) -> StorageResult<()> {
    let mut pending = vec![root];
    while let Some(oid) = pending.pop() {
        if known_complete.is_some_and(|known| known.contains(&oid)) {
            continue;
        }
        let Some(object) = catalog.get_ref(&oid) else {
            out.catalog_incomplete.insert(oid);
            continue;
        };
        if !out.catalog_complete.insert(oid) {
            continue;
        }
        if let Object::File(file) = object {
            if storage.has(file.content)? {
                out.storage_complete.insert(file.content);
            } else {
                out.storage_incomplete.insert(file.content);
            }
        }
        for dep in object.dependencies() {
            match catalog.get_ref(dep) {
                None => {
                    out.catalog_incomplete.insert(*dep);
                }
                Some(found) if !criteria.matches(found) => {
                    out.catalog_complete.insert(*dep);
                }
                Some(_) => pending.push(*dep),
            }
        }
    }
    Ok(())
}

/// Catalog objects and blobs reachable from `releases` through objects
/// `matches` accepts. Rejected objects are kept themselves but not
/// descended into.
pub(crate) fn collect_required(
    catalog: &Catalog,
    releases: &BTreeSet<Oid>,
    matches: impl Fn(&Object) -> bool,
) -> (BTreeSet<Oid>, BTreeSet<Oid>) {
    let mut required_catalog = BTreeSet::new();
    let mut required_storage = BTreeSet::new();
    let mut pending: Vec<Oid> = releases.iter().copied().collect();

    while let Some(oid) = pending.pop() {
        if !required_catalog.insert(oid) {
            continue;
        }
        let Some(object) = catalog.get_ref(&oid) else {
            continue;
        };
        if !matches(object) {
            continue;
        }
        if let Object::File(file) = object {
            required_storage.insert(file.content);
        }
        pending.extend(object.dependencies().iter().copied());
    }
    (required_catalog, required_storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_info::BuildInfo;
    use crate::criteria::CriteriaConfig;
    use aup_catalog::{File, Release, Unit};
    use aup_types::FileKind;

    fn info() -> BuildInfo {
        BuildInfo {
            src_branch: "main".into(),
            provider: "acme".into(),
            ..BuildInfo::current()
        }
    }

    fn criteria() -> CriteriaSet {
        CriteriaSet::parse(&[CriteriaConfig::default()], &info()).unwrap()
    }

    fn release(moment: u64, deps: &[Oid]) -> Release {
        let i = info();
        Release {
            dependencies: deps.iter().copied().collect(),
            src_branch: i.src_branch,
            src_moment: moment,
            platform_os: i.platform_os,
            platform_arch: i.platform_arch,
            compiler: i.compiler,
            compiler_optimization: i.compiler_optimization,
            provider: i.provider,
            ..Default::default()
        }
    }

    fn file(path: &str, kind: FileKind, content: Oid) -> File {
        File {
            kind,
            path: path.into(),
            perms: 0o644,
            size: 1,
            content,
            ..Default::default()
        }
    }

    #[test]
    fn newest_release_per_group() {
        let mut catalog = Catalog::new();
        let old = catalog.put(release(1, &[]).into());
        let new = catalog.put(release(2, &[]).into());
        let mut other_provider = release(0, &[]);
        other_provider.provider = "beta".into();
        let beta = catalog.put(other_provider.into());

        let all = CriteriaConfig {
            provider: vec!["*".into()],
            ..Default::default()
        };
        let set = CriteriaSet::parse(&[all], &info()).unwrap();
        let releases = catalog.enumerate(Some(ObjectType::Release));
        let most = most_recent_releases(&catalog, &set, &releases);
        assert_eq!(most, [new, beta].into_iter().collect());
        assert!(!most.contains(&old));
    }

    #[test]
    fn build_classifies_reachable_objects() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), true).unwrap();
        let present = aup_crypto::identify(b"present");
        let absent = aup_crypto::identify(b"absent");
        storage.put(present, b"present").unwrap();

        let mut catalog = Catalog::new();
        let f1 = catalog.put(file("bin/a", FileKind::Runtime, present).into());
        let f2 = catalog.put(file("bin/b", FileKind::Runtime, absent).into());
        let dbg = catalog.put(file("bin/a.pdb", FileKind::Debug, absent).into());
        let missing = aup_crypto::identify(b"missing unit");
        let unit = catalog.put(
            Unit {
                dependencies: [f1, f2, dbg].into_iter().collect(),
                name: "core".into(),
                ..Default::default()
            }
            .into(),
        );
        let rel = catalog.put(release(5, &[unit, missing]).into());

        let set = criteria();
        let index = Index::build(&catalog, &storage, &set, &CriteriaSet::default()).unwrap();
        let target = &index.target;
        assert_eq!(target.most_releases, [rel].into_iter().collect());
        assert_eq!(target.catalog_incomplete, [missing].into_iter().collect());
        assert!(target.catalog_complete.contains(&dbg));
        assert_eq!(target.storage_complete, [present].into_iter().collect());
        assert_eq!(target.storage_incomplete, [absent].into_iter().collect());
        assert!(!target.is_complete());
        assert!(index.buffer.most_releases.is_empty());
        assert!(index.wants_catalog(&missing));
        assert!(index.wants_storage(&absent));
    }

    #[test]
    fn changes_report_only_new_members() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), true).unwrap();
        let blob = aup_crypto::identify(b"x");
        let mut catalog = Catalog::new();
        let f = catalog.put(file("x", FileKind::Runtime, blob).into());
        let rel = catalog.put(release(1, &[f]).into());

        let set = criteria();
        let empty = CriteriaSet::default();
        let before = Index::build(&catalog, &storage, &set, &empty).unwrap();
        let events = before.changes_since(&Index::default());
        assert!(events.contains(&InstanceEvent::NewReleaseFound(rel)));
        assert!(events.contains(&InstanceEvent::StorageIncomplete {
            audience: Audience::Target,
            oid: blob
        }));
        assert!(!events.contains(&InstanceEvent::TotallyComplete {
            audience: Audience::Target
        }));

        storage.put(blob, b"x").unwrap();
        let after = Index::build(&catalog, &storage, &set, &empty).unwrap();
        let events = after.changes_since(&before);
        assert_eq!(
            events,
            vec![
                InstanceEvent::StorageComplete {
                    audience: Audience::Target,
                    oid: blob
                },
                InstanceEvent::TotallyComplete {
                    audience: Audience::Target
                },
            ]
        );
        assert!(after.changes_since(&after).is_empty());
    }

    #[test]
    fn catalog_arrival_patches_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path(), true).unwrap();
        let blob = aup_crypto::identify(b"payload");
        storage.put(blob, b"payload").unwrap();

        let late_file = file("lib/x", FileKind::Runtime, blob);
        let late_oid = Object::from(late_file.clone()).identify();
        let mut catalog = Catalog::new();
        catalog.put(release(1, &[late_oid]).into());

        let set = criteria();
        let empty = CriteriaSet::default();
        let mut index = Index::build(&catalog, &storage, &set, &empty).unwrap();
        assert!(index.target.catalog_incomplete.contains(&late_oid));

        catalog.put(late_file.into());
        let events = index
            .catalog_object_arrived(&catalog, &storage, [&set, &empty], late_oid)
            .unwrap();
        assert_eq!(
            events,
            vec![
                InstanceEvent::CatalogComplete {
                    audience: Audience::Target,
                    oid: late_oid
                },
                InstanceEvent::StorageComplete {
                    audience: Audience::Target,
                    oid: blob
                },
                InstanceEvent::TotallyComplete {
                    audience: Audience::Target
                },
            ]
        );
        assert_eq!(index, Index::build(&catalog, &storage, &set, &empty).unwrap());

        let again = index
            .catalog_object_arrived(&catalog, &storage, [&set, &empty], late_oid)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn required_stops_at_rejected_objects() {
        let mut catalog = Catalog::new();
        let runtime_blob = aup_crypto::identify(b"rt");
        let debug_blob = aup_crypto::identify(b"dbg");
        let rt = catalog.put(file("a", FileKind::Runtime, runtime_blob).into());
        let dbg = catalog.put(file("a.dbg", FileKind::Debug, debug_blob).into());
        let rel = catalog.put(release(1, &[rt, dbg]).into());

        let set = criteria();
        let releases = [rel].into_iter().collect();
        let (objects, blobs) = collect_required(&catalog, &releases, |o| set.matches(o));
        assert_eq!(objects, [rel, rt, dbg].into_iter().collect());
        assert_eq!(blobs, [runtime_blob].into_iter().collect());
    }
}
