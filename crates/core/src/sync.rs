//! Generic Sync Engine
//!
//! Applies diff sets to a shadow [`ProxyTree`] and forwards each change to the
//! host scene. Every proxy carries the revision (room sequence number) of the
//! command that last touched it; entries that are not newer are discarded,
//! which makes re-applying a diff set after a resync a no-op.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::diff::{compute_diff, DiffEntry, DiffSet};
use crate::error::{Error, Result};
use crate::proxy::{DataProxy, ProxyId, ProxyTree};
use crate::scene::{ChangeKind, SceneAdapter};

/// Revision token: the room sequence number that committed a change
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

/// Last applied revision per proxy, including deleted proxies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    revisions: BTreeMap<ProxyId, Revision>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Revision> {
        self.revisions.get(id).copied()
    }

    /// A revision not newer than the recorded one is stale
    pub fn is_stale(&self, id: &str, revision: Revision) -> bool {
        self.get(id).is_some_and(|recorded| revision <= recorded)
    }

    /// Record `revision`, never moving backwards
    pub fn record(&mut self, id: &str, revision: Revision) {
        let slot = self.revisions.entry(id.to_string()).or_default();
        if revision > *slot {
            *slot = revision;
        }
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Revision)> {
        self.revisions.iter().map(|(id, rev)| (id.as_str(), *rev))
    }
}

/// Full state transferred to late joiners
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneSnapshot {
    /// Last sequence number folded into this snapshot
    pub sequence: u64,
    pub proxies: Vec<DataProxy>,
    /// Revisions of live and deleted proxies
    pub revisions: BTreeMap<ProxyId, u64>,
}

/// Diff entry that could not be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub id: ProxyId,
    pub reason: String,
}

/// Outcome of applying one diff set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    /// Entries discarded because their revision was not newer, or because a
    /// pending local delete supersedes them
    pub stale: usize,
    pub skipped: Vec<SkippedEntry>,
    /// Set when the apply stopped early between two entries
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn is_noop(&self) -> bool {
        self.applied == 0 && self.skipped.is_empty()
    }
}

/// Local changes that remote entries must not overwrite
#[derive(Debug, Clone, Default)]
pub struct Pinned {
    attributes: BTreeMap<ProxyId, BTreeSet<String>>,
    /// Proxies removed by a pending local diff
    deleted: BTreeSet<ProxyId>,
}

impl Pinned {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect everything written by `diffs`
    pub fn from_diffs<'a>(diffs: impl IntoIterator<Item = &'a DiffSet>) -> Self {
        let mut pinned = Self::new();
        for entry in diffs.into_iter().flat_map(DiffSet::iter) {
            let id = entry.id().to_string();
            match entry {
                DiffEntry::Deleted { .. } => {
                    pinned.attributes.remove(&id);
                    pinned.deleted.insert(id);
                }
                _ => {
                    pinned.deleted.remove(&id);
                    pinned
                        .attributes
                        .entry(id)
                        .or_default()
                        .extend(entry.written_attributes().into_iter().map(str::to_string));
                }
            }
        }
        pinned
    }

    pub fn attributes(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.attributes.get(id)
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.deleted.contains(id)
    }
}

enum EntryOutcome {
    Applied,
    Stale,
}

/// Shadow tree plus its revision bookkeeping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replica {
    tree: ProxyTree,
    sync: SyncState,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &ProxyTree {
        &self.tree
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    pub fn from_snapshot(snapshot: &SceneSnapshot) -> Self {
        let mut sync = SyncState::new();
        for (id, rev) in &snapshot.revisions {
            sync.record(id, Revision(*rev));
        }
        Self {
            tree: ProxyTree::from_proxies(snapshot.proxies.iter().cloned()),
            sync,
        }
    }

    pub fn snapshot(&self, sequence: u64) -> SceneSnapshot {
        SceneSnapshot {
            sequence,
            proxies: self.tree.to_vec(),
            revisions: self
                .sync
                .iter()
                .map(|(id, rev)| (id.to_string(), rev.0))
                .collect(),
        }
    }

    /// Forget deleted proxies whose deletion is older than `before`.
    /// Returns how many tombstones were dropped.
    pub fn prune_tombstones(&mut self, before: Revision) -> usize {
        let tree = &self.tree;
        let count = self.sync.len();
        self.sync
            .revisions
            .retain(|id, rev| *rev >= before || tree.contains(id));
        count - self.sync.len()
    }

    /// Apply a committed diff set
    pub fn apply(
        &mut self,
        diff: &DiffSet,
        revision: Revision,
        scene: &mut dyn SceneAdapter,
    ) -> ApplyReport {
        self.apply_with(diff, Some(revision), scene, &Pinned::new(), None)
    }

    /// Apply a diff set, honoring pinned attributes and a cancellation flag.
    ///
    /// `revision` is `None` for local, not yet committed changes: they are
    /// neither checked for staleness nor recorded. Cancellation is observed
    /// only between entries.
    pub fn apply_with(
        &mut self,
        diff: &DiffSet,
        revision: Option<Revision>,
        scene: &mut dyn SceneAdapter,
        pinned: &Pinned,
        cancel: Option<&AtomicBool>,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();

        for entry in diff.iter() {
            if cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                debug!(applied = report.applied, "Apply cancelled");
                report.cancelled = true;
                break;
            }

            match self.apply_entry(entry, revision, scene, pinned) {
                Ok(EntryOutcome::Applied) => report.applied += 1,
                Ok(EntryOutcome::Stale) => report.stale += 1,
                Err(e) => {
                    warn!(proxy = %entry.id(), error = %e, "Skipping diff entry");
                    report.skipped.push(SkippedEntry {
                        id: entry.id().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }

    fn apply_entry(
        &mut self,
        entry: &DiffEntry,
        revision: Option<Revision>,
        scene: &mut dyn SceneAdapter,
        pinned: &Pinned,
    ) -> Result<EntryOutcome> {
        let id = entry.id();
        if let Some(rev) = revision {
            if self.sync.is_stale(id, rev) {
                debug!(proxy = %id, revision = rev.0, "Discarding stale entry");
                return Ok(EntryOutcome::Stale);
            }
        }
        if pinned.is_deleted(id) {
            debug!(proxy = %id, "Entry superseded by pending local delete");
            return Ok(EntryOutcome::Stale);
        }
        let keep = pinned.attributes(id);

        let (kind, touched) = match entry {
            DiffEntry::Created { proxy } => {
                let missing = self.tree.missing_dependencies(proxy);
                if !missing.is_empty() {
                    return Err(Error::MissingDependency {
                        id: id.to_string(),
                        missing,
                    });
                }

                let mut proxy = proxy.clone();
                let kind = match self.tree.get(id) {
                    Some(existing) => {
                        for name in keep.into_iter().flatten() {
                            match existing.attributes.get(name) {
                                Some(value) => {
                                    proxy.attributes.insert(name.clone(), value.clone());
                                }
                                None => {
                                    proxy.attributes.remove(name);
                                }
                            }
                        }
                        ChangeKind::Updated
                    }
                    None => ChangeKind::Created,
                };
                self.tree.insert(proxy);
                (kind, self.tree.get(id).cloned())
            }
            DiffEntry::Updated {
                changed,
                removed,
                dependencies,
                ..
            } => {
                if !self.tree.contains(id) {
                    return Err(Error::UnknownProxy(id.to_string()));
                }
                if let Some(deps) = dependencies {
                    let missing: Vec<ProxyId> = deps
                        .iter()
                        .filter(|d| d.as_str() != id && !self.tree.contains(d))
                        .cloned()
                        .collect();
                    if !missing.is_empty() {
                        return Err(Error::MissingDependency {
                            id: id.to_string(),
                            missing,
                        });
                    }
                }

                let is_pinned = |name: &str| keep.is_some_and(|names| names.contains(name));
                let proxy = self
                    .tree
                    .get_mut(id)
                    .ok_or_else(|| Error::UnknownProxy(id.to_string()))?;
                for (name, value) in changed {
                    if !is_pinned(name.as_str()) {
                        proxy.attributes.insert(name.clone(), value.clone());
                    }
                }
                for name in removed {
                    if !is_pinned(name.as_str()) {
                        proxy.attributes.remove(name);
                    }
                }
                if let Some(deps) = dependencies {
                    proxy.dependencies = deps.clone();
                }
                (ChangeKind::Updated, Some(proxy.clone()))
            }
            DiffEntry::Deleted { .. } => {
                if !self.tree.contains(id) {
                    // Tombstone only: keeps an older Created from resurrecting it
                    (ChangeKind::Deleted, None)
                } else {
                    let dependents = self.tree.dependents_of(id);
                    if !dependents.is_empty() {
                        return Err(Error::DanglingDependency {
                            id: id.to_string(),
                            dependents,
                        });
                    }
                    (ChangeKind::Deleted, self.tree.remove(id))
                }
            }
        };

        if let Some(rev) = revision {
            self.sync.record(id, rev);
        }
        if let Some(proxy) = touched {
            if let Err(e) = scene.apply_proxy_change(kind, &proxy) {
                warn!(proxy = %id, error = %e, "Scene rejected proxy change");
            }
        }

        Ok(EntryOutcome::Applied)
    }
}

/// Client-side engine: local capture, remote apply, acknowledgement
#[derive(Debug, Default)]
pub struct SyncEngine {
    replica: Replica,
    /// Local diffs sent but not yet committed, oldest first
    pending: VecDeque<DiffSet>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn tree(&self) -> &ProxyTree {
        self.replica.tree()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Diff the live scene against the shadow tree and adopt the result
    /// locally. Returns `None` when nothing changed.
    pub fn capture_local(&mut self, scene: &dyn SceneAdapter) -> Result<Option<DiffSet>> {
        let current = ProxyTree::from_proxies(scene.snapshot_scene());
        let diff = compute_diff(self.replica.tree(), &current)?;
        if diff.is_empty() {
            return Ok(None);
        }

        debug!(entries = diff.len(), "Captured local changes");
        self.replica.tree = current;
        self.pending.push_back(diff.clone());
        Ok(Some(diff))
    }

    /// The oldest pending local diff was committed at `revision`
    pub fn acknowledge(&mut self, revision: Revision) -> Option<DiffSet> {
        let diff = self.pending.pop_front()?;
        for id in diff.touched_ids() {
            self.replica.sync.record(id, revision);
        }
        Some(diff)
    }

    /// Apply a diff committed by another client
    pub fn apply_remote(
        &mut self,
        diff: &DiffSet,
        revision: Revision,
        scene: &mut dyn SceneAdapter,
    ) -> ApplyReport {
        let pinned = self.pinned();
        self.replica.apply_with(diff, Some(revision), scene, &pinned, None)
    }

    /// Like [`apply_remote`](Self::apply_remote), stopping between entries
    /// once `cancel` is set. Re-applying the same diff later resumes it.
    pub fn apply_remote_cancellable(
        &mut self,
        diff: &DiffSet,
        revision: Revision,
        scene: &mut dyn SceneAdapter,
        cancel: &AtomicBool,
    ) -> ApplyReport {
        let pinned = self.pinned();
        self.replica
            .apply_with(diff, Some(revision), scene, &pinned, Some(cancel))
    }

    /// Replace the shadow tree with a room snapshot, keeping local changes
    /// that are still awaiting commit, and bring the scene in line.
    pub fn load_snapshot(
        &mut self,
        snapshot: &SceneSnapshot,
        scene: &mut dyn SceneAdapter,
    ) -> Result<()> {
        let mut next = Replica::from_snapshot(snapshot);
        for diff in &self.pending {
            next.apply_with(diff, None, &mut crate::scene::NullScene, &Pinned::new(), None);
        }

        let changes = compute_diff(self.replica.tree(), next.tree())?;
        for entry in changes.iter() {
            let id = entry.id();
            let result = match entry {
                DiffEntry::Deleted { .. } => match self.replica.tree().get(id) {
                    Some(old) => scene.apply_proxy_change(ChangeKind::Deleted, old),
                    None => Ok(()),
                },
                DiffEntry::Created { proxy } if !self.replica.tree().contains(id) => {
                    scene.apply_proxy_change(ChangeKind::Created, proxy)
                }
                _ => match next.tree().get(id) {
                    Some(proxy) => scene.apply_proxy_change(ChangeKind::Updated, proxy),
                    None => Ok(()),
                },
            };
            if let Err(e) = result {
                warn!(proxy = %id, error = %e, "Scene rejected snapshot change");
            }
        }

        debug!(
            sequence = snapshot.sequence,
            proxies = next.tree().len(),
            "Loaded room snapshot"
        );
        self.replica = next;
        Ok(())
    }

    /// Attributes and deletions of pending local diffs; they win over
    /// earlier remote commits because they will be committed later
    fn pinned(&self) -> Pinned {
        Pinned::from_diffs(&self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MemoryScene, NullScene};
    use pretty_assertions::assert_eq;

    fn created(proxy: DataProxy) -> DiffEntry {
        DiffEntry::Created { proxy }
    }

    fn color(color: &str) -> DiffSet {
        DiffSet::new(vec![DiffEntry::Updated {
            id: "cube-1".into(),
            changed: [("color".to_string(), color.into())].into_iter().collect(),
            removed: Vec::new(),
            dependencies: None,
        }])
    }

    fn cube_scene() -> DiffSet {
        DiffSet::new(vec![
            created(DataProxy::new("mesh-data-1", "mesh")),
            created(
                DataProxy::new("cube-1", "object")
                    .with_attribute("color", "red")
                    .depends_on("mesh-data-1"),
            ),
        ])
    }

    #[test]
    fn test_apply_twice_is_noop() {
        let mut replica = Replica::new();
        let mut scene = MemoryScene::new();

        let first = replica.apply(&cube_scene(), Revision(1), &mut scene);
        assert_eq!(first.applied, 2);
        let after_first = replica.clone();
        scene.clear_history();

        let second = replica.apply(&cube_scene(), Revision(1), &mut scene);
        assert!(second.is_noop());
        assert_eq!(second.stale, 2);
        assert_eq!(replica, after_first);
        assert!(scene.history().is_empty());
    }

    #[test]
    fn test_later_update_wins() {
        let mut replica = Replica::new();
        replica.apply(&cube_scene(), Revision(1), &mut NullScene);
        replica.apply(&color("red"), Revision(2), &mut NullScene);
        replica.apply(&color("blue"), Revision(3), &mut NullScene);
        // Redelivery of the older update must not flicker back
        replica.apply(&color("red"), Revision(2), &mut NullScene);

        let cube = replica.tree().get("cube-1").unwrap();
        assert_eq!(cube.attribute("color").unwrap(), "blue");
    }

    #[test]
    fn test_delete_with_dependents_skipped() {
        let mut replica = Replica::new();
        replica.apply(&cube_scene(), Revision(1), &mut NullScene);

        let diff = DiffSet::new(vec![
            DiffEntry::Deleted {
                id: "mesh-data-1".into(),
            },
            created(DataProxy::new("lamp", "light")),
        ]);
        let report = replica.apply(&diff, Revision(2), &mut NullScene);

        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].id, "mesh-data-1");
        assert!(replica.tree().contains("mesh-data-1"));
        assert!(replica.tree().contains("lamp"));
    }

    #[test]
    fn test_delete_dependents_first_succeeds() {
        let mut replica = Replica::new();
        replica.apply(&cube_scene(), Revision(1), &mut NullScene);
        let mut scene = MemoryScene::new();

        let diff = DiffSet::new(vec![
            DiffEntry::Deleted {
                id: "cube-1".into(),
            },
            DiffEntry::Deleted {
                id: "mesh-data-1".into(),
            },
        ]);
        let report = replica.apply(&diff, Revision(2), &mut scene);

        assert!(report.skipped.is_empty());
        assert!(replica.tree().is_empty());
        assert_eq!(scene.history().len(), 2);
    }

    #[test]
    fn test_missing_dependency_skipped() {
        let mut replica = Replica::new();
        let diff = DiffSet::new(vec![created(
            DataProxy::new("cube-1", "object").depends_on("mesh-data-1"),
        )]);

        let report = replica.apply(&diff, Revision(1), &mut NullScene);
        assert_eq!(report.skipped.len(), 1);
        assert!(replica.tree().is_empty());
        assert_eq!(replica.sync_state().get("cube-1"), None);
    }

    #[test]
    fn test_tombstone_blocks_resurrection() {
        let mut replica = Replica::new();
        replica.apply(&cube_scene(), Revision(1), &mut NullScene);
        let delete = DiffSet::new(vec![
            DiffEntry::Deleted {
                id: "cube-1".into(),
            },
            DiffEntry::Deleted {
                id: "mesh-data-1".into(),
            },
        ]);
        replica.apply(&delete, Revision(2), &mut NullScene);

        let snapshot = replica.snapshot(2);
        let mut joiner = Replica::from_snapshot(&snapshot);
        let report = joiner.apply(&cube_scene(), Revision(1), &mut NullScene);

        assert_eq!(report.stale, 2);
        assert!(joiner.tree().is_empty());
    }

    #[test]
    fn test_prune_keeps_live_and_recent() {
        let mut replica = Replica::new();
        replica.apply(&cube_scene(), Revision(1), &mut NullScene);
        let lamp = DiffSet::new(vec![created(DataProxy::new("lamp", "light"))]);
        replica.apply(&lamp, Revision(2), &mut NullScene);
        let delete = |id: &str| DiffSet::new(vec![DiffEntry::Deleted { id: id.into() }]);
        replica.apply(&delete("lamp"), Revision(3), &mut NullScene);
        replica.apply(&delete("cube-1"), Revision(5), &mut NullScene);

        assert_eq!(replica.prune_tombstones(Revision(4)), 1);
        assert_eq!(replica.sync_state().get("lamp"), None);
        assert_eq!(replica.sync_state().get("cube-1"), Some(Revision(5)));
        // Live proxies keep their revision however old
        assert_eq!(replica.sync_state().get("mesh-data-1"), Some(Revision(1)));
    }

    #[test]
    fn test_cancel_between_entries() {
        let mut replica = Replica::new();
        let cancel = AtomicBool::new(true);
        let report = replica.apply_with(
            &cube_scene(),
            Some(Revision(1)),
            &mut NullScene,
            &Pinned::new(),
            Some(&cancel),
        );
        assert!(report.cancelled);
        assert_eq!(report.applied, 0);

        cancel.store(false, Ordering::Release);
        let resumed = replica.apply(&cube_scene(), Revision(1), &mut NullScene);
        assert_eq!(resumed.applied, 2);
    }

    #[test]
    fn test_capture_and_acknowledge() {
        let mut engine = SyncEngine::new();
        let mut scene = MemoryScene::new();
        scene.upsert(DataProxy::new("cube-1", "object").with_attribute("color", "red"));

        let diff = engine.capture_local(&scene).unwrap().unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(engine.pending_len(), 1);
        assert!(engine.capture_local(&scene).unwrap().is_none());

        engine.acknowledge(Revision(7));
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(
            engine.replica().sync_state().get("cube-1"),
            Some(Revision(7))
        );
    }

    #[test]
    fn test_pending_local_attribute_survives_older_remote() {
        let mut engine = SyncEngine::new();
        let mut scene = MemoryScene::new();
        engine.apply_remote(&cube_scene(), Revision(1), &mut scene);

        scene.edit("cube-1", |p| {
            p.set_attribute("color", "green");
        });
        engine.capture_local(&scene).unwrap();

        // Committed before our pending edit; ours will land after it
        let mut remote = color("blue");
        if let DiffEntry::Updated { changed, .. } = &mut remote.entries[0] {
            changed.insert("size".into(), 3.into());
        }
        engine.apply_remote(&remote, Revision(2), &mut scene);

        let cube = engine.tree().get("cube-1").unwrap();
        assert_eq!(cube.attribute("color").unwrap(), "green");
        assert_eq!(cube.attribute("size").unwrap(), 3);
        assert_eq!(scene.get("cube-1").unwrap().attribute("color").unwrap(), "green");
    }

    #[test]
    fn test_pending_local_delete_not_undone() {
        let object = DiffSet::new(vec![created(DataProxy::new("cube-1", "object"))]);
        let light = DiffSet::new(vec![created(DataProxy::new("cube-1", "light"))]);

        let mut engine = SyncEngine::new();
        let mut scene = MemoryScene::new();
        engine.apply_remote(&object, Revision(1), &mut scene);

        scene.remove("cube-1");
        let local = engine.capture_local(&scene).unwrap().unwrap();

        // Recreated by a peer and committed ahead of our delete
        let report = engine.apply_remote(&light, Revision(2), &mut scene);
        assert_eq!(report.stale, 1);
        assert!(engine.tree().get("cube-1").is_none());
        assert!(scene.get("cube-1").is_none());

        engine.acknowledge(Revision(3));

        let mut room = Replica::new();
        room.apply(&object, Revision(1), &mut NullScene);
        room.apply(&light, Revision(2), &mut NullScene);
        room.apply(&local, Revision(3), &mut NullScene);
        assert_eq!(engine.tree(), room.tree());

        // Once acknowledged, later remote creations apply again
        engine.apply_remote(&light, Revision(4), &mut scene);
        assert_eq!(scene.get("cube-1").unwrap().kind, "light");
    }

    #[test]
    fn test_load_snapshot_updates_scene() {
        let mut source = Replica::new();
        source.apply(&cube_scene(), Revision(4), &mut NullScene);
        let snapshot = source.snapshot(4);

        let mut engine = SyncEngine::new();
        let mut scene = MemoryScene::new();
        scene.upsert(DataProxy::new("stray", "empty"));
        engine.capture_local(&scene).unwrap();
        engine.acknowledge(Revision(2));

        engine.load_snapshot(&snapshot, &mut scene).unwrap();

        assert_eq!(engine.tree(), source.tree());
        assert!(scene.get("stray").is_none());
        assert_eq!(scene.get("cube-1").unwrap().attribute("color").unwrap(), "red");
    }
}
