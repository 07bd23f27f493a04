//! Filepath: src/core/generation.rs
//! Generation store: the on-disk archive of every category's snapshots.
//!
//! Layout:
//! ```text
//! <archive>/<category>/meta.json            memo + per-snapshot bookkeeping
//! <archive>/<category>/<YYYYMMDD_HHmmss>/   one snapshot (full copy)
//! <archive>/<category>/.partial/            staging for copies in progress
//! ```
//!
//! A snapshot becomes visible only through a single rename out of `.partial`,
//! so an interrupted copy never shows up as a listed snapshot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::core::clock::{Clock, SnapshotId, next_id};
use crate::core::error::{EngineError, EngineResult, IoContext};
use crate::core::metadata::{CategoryMeta, MetadataStore, SnapshotMeta};
use crate::infra::io::{Removal, copy_tree, fingerprint, remove_tree_verified, subdirectories, sync_dir};

/// Names starting with this prefix belong to the engine (staging, retired
/// live folders) and are never categories.
pub const RESERVED_PREFIX: &str = ".svault-";

const PARTIAL_DIR: &str = ".partial";

/// One stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub is_auto: bool,
    pub path: PathBuf,
    pub corrupted: bool,
}

/// Result of a successful `create`.
#[derive(Debug)]
pub struct Created {
    pub snapshot: Snapshot,
    /// Fingerprint of the source taken before the copy.
    pub fingerprint: Option<u64>,
    pub pruned: PruneReport,
}

/// What a retention pass removed, and what it could not.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub removed: Vec<SnapshotId>,
    pub failed: Vec<(SnapshotId, EngineError)>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Reject names that cannot be a single directory component, or that clash
/// with engine-owned names.
pub fn validate_category(name: &str) -> EngineResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.starts_with(RESERVED_PREFIX);
    if bad {
        return Err(EngineError::InvalidCategory(name.to_string()));
    }
    Ok(())
}

pub struct GenerationStore {
    archive_root: PathBuf,
    clock: Arc<dyn Clock>,
    parallel_copy: bool,
}

impl std::fmt::Debug for GenerationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStore")
            .field("archive_root", &self.archive_root)
            .field("parallel_copy", &self.parallel_copy)
            .finish_non_exhaustive()
    }
}

impl GenerationStore {
    pub fn new(archive_root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            archive_root: archive_root.into(),
            clock,
            parallel_copy: true,
        }
    }

    pub fn with_parallel_copy(mut self, parallel: bool) -> Self {
        self.parallel_copy = parallel;
        self
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    pub fn category_dir(&self, category: &str) -> PathBuf {
        self.archive_root.join(category)
    }

    fn meta(&self, category: &str) -> MetadataStore {
        MetadataStore::new(&self.category_dir(category))
    }

    /// Copy `<source_root>/<category>` into a new snapshot, then apply
    /// retention with `limit`. Pruning failures are reported in the result
    /// and never undo the new snapshot.
    #[instrument(skip(self, source_root), fields(root = %source_root.display()))]
    pub fn create(
        &self,
        source_root: &Path,
        category: &str,
        is_auto: bool,
        limit: usize,
    ) -> EngineResult<Created> {
        validate_category(category)?;
        let source = source_root.join(category);
        if !source.is_dir() {
            return Err(EngineError::SourceMissing {
                category: category.to_string(),
            });
        }

        let cat_dir = self.category_dir(category);
        let partial = cat_dir.join(PARTIAL_DIR);
        fs::create_dir_all(&partial)
            .io_context(|| format!("create staging area: {}", partial.display()))?;

        let print = match fingerprint(&source) {
            Ok(p) => Some(p),
            Err(e) => {
                debug!(error = %e, "fingerprint unavailable");
                None
            }
        };

        // Dropped (and removed) on every early return below.
        let staging = tempfile::Builder::new()
            .prefix("snap-")
            .tempdir_in(&partial)
            .io_context(|| format!("create staging dir in {}", partial.display()))?;

        let stats = copy_tree(&source, staging.path(), self.parallel_copy).map_err(|e| {
            if source.is_dir() {
                EngineError::io(format!("copy '{category}' into archive"), e)
            } else {
                EngineError::SourceMissing {
                    category: category.to_string(),
                }
            }
        })?;

        let latest = self.latest_id(category)?;
        let id = next_id(self.clock.now(), latest.as_ref()).ok_or_else(|| {
            EngineError::io(
                format!("allocate snapshot id for '{category}'"),
                std::io::Error::other(format!(
                    "newest snapshot id {} is malformed",
                    latest.as_ref().map(|l| l.as_str()).unwrap_or_default()
                )),
            )
        })?;
        let final_path = cat_dir.join(id.as_str());

        fs::rename(staging.path(), &final_path)
            .io_context(|| format!("publish snapshot {}", final_path.display()))?;
        drop(staging);
        if let Err(e) = sync_dir(&cat_dir) {
            debug!(error = %e, "archive dir fsync failed");
        }

        let entry = SnapshotMeta {
            is_auto,
            fingerprint: print,
            corrupted: false,
        };
        if let Err(e) = self
            .meta(category)
            .update(|m| {
                m.snapshots.insert(id.to_string(), entry);
            })
        {
            warn!(snapshot = %id, error = %e, "snapshot stored but metadata not updated");
        }

        info!(
            snapshot = %id,
            is_auto,
            files = stats.files,
            bytes = stats.bytes,
            "snapshot created"
        );

        let pruned = self.prune_after_create(category, limit);

        Ok(Created {
            snapshot: Snapshot {
                id,
                is_auto,
                path: final_path,
                corrupted: false,
            },
            fingerprint: print,
            pruned,
        })
    }

    /// Retention pass following a successful create. The snapshot is already
    /// published, so a failure here is logged rather than returned.
    fn prune_after_create(&self, category: &str, limit: usize) -> PruneReport {
        match self.prune(category, limit) {
            Ok(report) => {
                for (old, err) in &report.failed {
                    warn!(snapshot = %old, error = %err, "retention could not remove snapshot");
                }
                report
            }
            Err(e) => {
                warn!(category, error = %e, "retention skipped after snapshot");
                PruneReport::default()
            }
        }
    }

    /// Delete oldest snapshots until at most `limit` remain.
    pub fn prune(&self, category: &str, limit: usize) -> EngineResult<PruneReport> {
        let snapshots = self.list(category)?;
        let mut report = PruneReport::default();
        if snapshots.len() <= limit {
            return Ok(report);
        }

        // `list` is newest first; walk the excess oldest first.
        for snap in snapshots.iter().skip(limit).rev() {
            match self.remove_snapshot(category, snap) {
                Ok(()) => {
                    debug!(snapshot = %snap.id, "pruned");
                    report.removed.push(snap.id.clone());
                }
                Err(e) => report.failed.push((snap.id.clone(), e)),
            }
        }

        if !report.removed.is_empty() {
            info!(category, removed = report.removed.len(), limit, "retention applied");
        }
        Ok(report)
    }

    /// Permanently remove one snapshot.
    #[instrument(skip(self))]
    pub fn delete_one(&self, category: &str, timestamp: &str) -> EngineResult<()> {
        let snap = self.find(category, timestamp)?;
        self.remove_snapshot(category, &snap)?;
        info!(snapshot = %snap.id, "snapshot deleted");
        Ok(())
    }

    /// Remove every snapshot and the category's metadata. Returns how many
    /// snapshots were removed.
    #[instrument(skip(self))]
    pub fn delete_all(&self, category: &str) -> EngineResult<usize> {
        validate_category(category)?;
        let cat_dir = self.category_dir(category);
        if !cat_dir.is_dir() {
            return Err(EngineError::CategoryNotFound {
                category: category.to_string(),
            });
        }
        let count = self.list(category)?.len();

        match remove_tree_verified(&cat_dir) {
            Removal::Removed => {
                let _ = sync_dir(&self.archive_root);
                info!(count, "category archive removed");
                Ok(count)
            }
            Removal::Untouched(e) => Err(EngineError::io(
                format!("remove archive of '{category}'"),
                e,
            )),
            Removal::Partial { remaining, error } => {
                // Whatever snapshots survived are no longer trustworthy.
                self.mark_all_corrupted(category);
                Err(EngineError::PartialFailure {
                    category: category.to_string(),
                    detail: format!("{remaining} archive entries could not be removed: {error}"),
                })
            }
        }
    }

    /// Snapshots of `category`, newest first. An unknown category has none.
    pub fn list(&self, category: &str) -> EngineResult<Vec<Snapshot>> {
        validate_category(category)?;
        let cat_dir = self.category_dir(category);
        let names = subdirectories(&cat_dir)
            .io_context(|| format!("list snapshots: {}", cat_dir.display()))?;
        let meta = self.meta(category).load();

        let mut out: Vec<Snapshot> = names
            .iter()
            .filter_map(|n| SnapshotId::parse(n))
            .map(|id| snapshot_from(&cat_dir, &meta, id))
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(out)
    }

    pub fn find(&self, category: &str, timestamp: &str) -> EngineResult<Snapshot> {
        validate_category(category)?;
        let not_found = || EngineError::NotFound {
            category: category.to_string(),
            timestamp: timestamp.to_string(),
        };
        let id = SnapshotId::parse(timestamp).ok_or_else(not_found)?;
        let cat_dir = self.category_dir(category);
        if !cat_dir.join(id.as_str()).is_dir() {
            return Err(not_found());
        }
        Ok(snapshot_from(&cat_dir, &self.meta(category).load(), id))
    }

    /// Names of every category with an archive directory, sorted.
    pub fn categories(&self) -> EngineResult<Vec<String>> {
        let names = subdirectories(&self.archive_root)
            .io_context(|| format!("list archive: {}", self.archive_root.display()))?;
        Ok(names
            .into_iter()
            .filter(|n| validate_category(n).is_ok())
            .collect())
    }

    pub fn memo(&self, category: &str) -> EngineResult<String> {
        validate_category(category)?;
        Ok(self.meta(category).load().memo)
    }

    /// Store the memo; creates the category's archive directory if needed.
    pub fn set_memo(&self, category: &str, text: &str) -> EngineResult<()> {
        validate_category(category)?;
        self.meta(category).update(|m| m.memo = text.to_string())?;
        debug!(category, "memo saved");
        Ok(())
    }

    /// Full sidecar contents for `category` (empty when absent).
    pub fn metadata(&self, category: &str) -> EngineResult<CategoryMeta> {
        validate_category(category)?;
        Ok(self.meta(category).load())
    }

    /// Source fingerprint recorded for the newest snapshot.
    pub fn latest_fingerprint(&self, category: &str) -> EngineResult<Option<u64>> {
        Ok(self
            .latest_snapshot_print(category)?
            .and_then(|(_, print)| print))
    }

    /// Newest snapshot id together with its recorded fingerprint.
    pub fn latest_snapshot_print(
        &self,
        category: &str,
    ) -> EngineResult<Option<(SnapshotId, Option<u64>)>> {
        let Some(id) = self.latest_id(category)? else {
            return Ok(None);
        };
        let print = self
            .meta(category)
            .load()
            .snapshots
            .get(id.as_str())
            .and_then(|s| s.fingerprint);
        Ok(Some((id, print)))
    }

    /// Remove the category's archive directory if it holds no snapshots.
    /// Returns whether it was removed.
    pub fn remove_category_if_empty(&self, category: &str) -> EngineResult<bool> {
        if !self.list(category)?.is_empty() {
            return Ok(false);
        }
        let cat_dir = self.category_dir(category);
        if !cat_dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&cat_dir)
            .io_context(|| format!("remove empty archive: {}", cat_dir.display()))?;
        debug!(category, "empty archive removed");
        Ok(true)
    }

    /// Delete staging directories left by interrupted copies.
    pub fn sweep_partials(&self) -> usize {
        let Ok(categories) = self.categories() else {
            return 0;
        };
        let mut swept = 0;
        for cat in categories {
            let partial = self.category_dir(&cat).join(PARTIAL_DIR);
            let leftovers = subdirectories(&partial).unwrap_or_default();
            if leftovers.is_empty() {
                continue;
            }
            match fs::remove_dir_all(&partial) {
                Ok(()) => swept += leftovers.len(),
                Err(e) => warn!(path = %partial.display(), error = %e, "cannot sweep staging"),
            }
        }
        if swept > 0 {
            info!(swept, "removed interrupted snapshot copies");
        }
        swept
    }

    fn latest_id(&self, category: &str) -> EngineResult<Option<SnapshotId>> {
        let cat_dir = self.category_dir(category);
        let names = subdirectories(&cat_dir)
            .io_context(|| format!("list snapshots: {}", cat_dir.display()))?;
        Ok(names.iter().filter_map(|n| SnapshotId::parse(n)).max())
    }

    /// Remove-then-verify. A partial removal marks the snapshot corrupted so
    /// it stays listed instead of silently vanishing.
    fn remove_snapshot(&self, category: &str, snap: &Snapshot) -> EngineResult<()> {
        self.settle_removal(category, snap, remove_tree_verified(&snap.path))
    }

    fn settle_removal(&self, category: &str, snap: &Snapshot, removal: Removal) -> EngineResult<()> {
        match removal {
            Removal::Removed => {
                let key = snap.id.to_string();
                if let Err(e) = self.meta(category).update(|m| {
                    m.snapshots.remove(&key);
                }) {
                    warn!(snapshot = %snap.id, error = %e, "metadata not updated after delete");
                }
                Ok(())
            }
            Removal::Untouched(e) => Err(EngineError::io(
                format!("delete snapshot {} of '{category}'", snap.id),
                e,
            )),
            Removal::Partial { remaining, error } => {
                let key = snap.id.to_string();
                let _ = self.meta(category).update(|m| {
                    m.snapshots.entry(key).or_default().corrupted = true;
                });
                Err(EngineError::PartialFailure {
                    category: category.to_string(),
                    detail: format!(
                        "snapshot {} partially deleted, {remaining} entries remain: {error}",
                        snap.id
                    ),
                })
            }
        }
    }

    fn mark_all_corrupted(&self, category: &str) {
        let Ok(snapshots) = self.list(category) else {
            return;
        };
        if snapshots.is_empty() {
            return;
        }
        let _ = self.meta(category).update(|m| {
            for s in &snapshots {
                m.snapshots.entry(s.id.to_string()).or_default().corrupted = true;
            }
        });
    }
}

fn snapshot_from(cat_dir: &Path, meta: &CategoryMeta, id: SnapshotId) -> Snapshot {
    let entry = meta.snapshots.get(id.as_str()).cloned().unwrap_or_default();
    Snapshot {
        path: cat_dir.join(id.as_str()),
        is_auto: entry.is_auto,
        corrupted: entry.corrupted,
        id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::error::ErrorKind;
    use chrono::{Local, TimeDelta, TimeZone};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        clock: Arc<ManualClock>,
        store: GenerationStore,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("saves");
        fs::create_dir_all(root.join("SaveA/slot")).unwrap();
        fs::write(root.join("SaveA/slot/1.sav"), "v1").unwrap();
        let start = Local.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = GenerationStore::new(tmp.path().join("archive"), clock.clone());
        Fixture {
            _tmp: tmp,
            root,
            clock,
            store,
        }
    }

    #[test]
    fn create_copies_and_records_kind() {
        let f = fixture();
        let created = f.store.create(&f.root, "SaveA", true, 10).unwrap();
        assert_eq!(created.snapshot.id.as_str(), "20240501_100000");
        assert_eq!(
            fs::read_to_string(created.snapshot.path.join("slot/1.sav")).unwrap(),
            "v1"
        );
        let listed = f.store.list("SaveA").unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_auto);
        assert!(created.fingerprint.is_some());
        assert_eq!(
            f.store.latest_fingerprint("SaveA").unwrap(),
            created.fingerprint
        );
    }

    #[test]
    fn create_without_source_fails() {
        let f = fixture();
        let err = f.store.create(&f.root, "SaveZ", false, 10).unwrap_err();
        assert!(matches!(err, EngineError::SourceMissing { .. }));
        assert!(f.store.categories().unwrap().is_empty());
    }

    #[test]
    fn same_second_creates_stay_ordered() {
        let f = fixture();
        let a = f.store.create(&f.root, "SaveA", false, 10).unwrap();
        let b = f.store.create(&f.root, "SaveA", false, 10).unwrap();
        assert!(b.snapshot.id > a.snapshot.id);
        let ids: Vec<_> = f.store.list("SaveA").unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![b.snapshot.id, a.snapshot.id]);
    }

    #[test]
    fn retention_keeps_newest() {
        let f = fixture();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(f.store.create(&f.root, "SaveA", false, 3).unwrap().snapshot.id);
            f.clock.advance(TimeDelta::seconds(1));
        }
        let kept: Vec<_> = f.store.list("SaveA").unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(kept, vec![ids[3].clone(), ids[2].clone(), ids[1].clone()]);
        assert!(!f.store.category_dir("SaveA").join(ids[0].as_str()).exists());
    }

    #[test]
    fn delete_one_twice_is_not_found() {
        let f = fixture();
        let id = f.store.create(&f.root, "SaveA", false, 10).unwrap().snapshot.id;
        f.store.delete_one("SaveA", id.as_str()).unwrap();
        let err = f.store.delete_one("SaveA", id.as_str()).unwrap_err();
        assert!(err.is_not_found());
        assert!(f.store.delete_one("SaveA", "garbage").unwrap_err().is_not_found());
    }

    #[test]
    fn delete_all_removes_metadata() {
        let f = fixture();
        f.store.create(&f.root, "SaveA", false, 10).unwrap();
        f.store.set_memo("SaveA", "keep me?").unwrap();
        assert_eq!(f.store.delete_all("SaveA").unwrap(), 1);
        assert!(!f.store.category_dir("SaveA").exists());
        assert_eq!(f.store.memo("SaveA").unwrap(), "");
        assert!(matches!(
            f.store.delete_all("SaveA").unwrap_err(),
            EngineError::CategoryNotFound { .. }
        ));
    }

    #[test]
    fn retention_error_after_create_is_only_logged() {
        let f = fixture();
        fs::create_dir_all(f.store.archive_root()).unwrap();
        // A file where the category directory should be makes listing fail
        fs::write(f.store.category_dir("SaveQ"), "not a dir").unwrap();

        assert!(f.store.prune("SaveQ", 1).is_err());
        let report = f.store.prune_after_create("SaveQ", 1);
        assert!(report.removed.is_empty() && report.failed.is_empty());
    }

    #[test]
    fn partial_delete_stays_listed_as_corrupted() {
        let f = fixture();
        let snap = f.store.create(&f.root, "SaveA", false, 10).unwrap().snapshot;
        fs::remove_file(snap.path.join("slot/1.sav")).unwrap();

        let err = f
            .store
            .settle_removal(
                "SaveA",
                &snap,
                Removal::Partial {
                    remaining: 2,
                    error: std::io::Error::other("directory busy"),
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialFailure);

        let listed = f.store.list("SaveA").unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].corrupted);
        assert!(f.store.find("SaveA", snap.id.as_str()).unwrap().corrupted);

        // Retrying the delete clears it out for good
        f.store.delete_one("SaveA", snap.id.as_str()).unwrap();
        assert!(f.store.list("SaveA").unwrap().is_empty());
        assert!(f.store.metadata("SaveA").unwrap().snapshots.is_empty());
    }

    #[test]
    fn memo_without_snapshots() {
        let f = fixture();
        f.store.set_memo("SaveA", "first run").unwrap();
        assert_eq!(f.store.categories().unwrap(), vec!["SaveA"]);
        assert!(f.store.list("SaveA").unwrap().is_empty());
        assert!(f.store.remove_category_if_empty("SaveA").unwrap());
        assert!(f.store.categories().unwrap().is_empty());
    }

    #[test]
    fn partials_are_hidden_and_swept() {
        let f = fixture();
        f.store.create(&f.root, "SaveA", false, 10).unwrap();
        let leftover = f.store.category_dir("SaveA").join(PARTIAL_DIR).join("snap-x");
        fs::create_dir_all(&leftover).unwrap();
        assert_eq!(f.store.list("SaveA").unwrap().len(), 1);
        assert_eq!(f.store.sweep_partials(), 1);
        assert!(!leftover.exists());
    }

    #[test]
    fn rejects_bad_category_names() {
        for name in ["", ".", "..", "a/b", ".svault-staging-1"] {
            assert!(matches!(
                validate_category(name),
                Err(EngineError::InvalidCategory(_))
            ));
        }
        validate_category("Save A (1)").unwrap();
    }
}
