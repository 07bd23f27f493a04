//! Restore: replace a category's live folder with a snapshot.
//!
//! Sequence, all inside the watched root so every rename stays on one
//! filesystem:
//! 1. copy the snapshot into `.svault-staging-*` (failure: live untouched)
//! 2. rename live to `.svault-retired-*` (failure: live untouched, locked)
//! 3. rename staging to live (failure: rename retired back; if that also
//!    fails the category is degraded)
//! 4. permanently delete the retired tree
//!
//! Nothing goes to a recycle bin; step 4 is a direct `remove_dir_all`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info, instrument, warn};

use crate::core::error::{EngineError, EngineResult, IoContext};
use crate::core::generation::GenerationStore;
use crate::infra::io::{CopyStats, Removal, copy_tree, remove_tree_verified, sync_dir};

const STAGING_PREFIX: &str = ".svault-staging-";
const RETIRED_PREFIX: &str = ".svault-retired-";

#[derive(Debug)]
pub struct Restored {
    pub stats: CopyStats,
    /// Retired live tree that could not be deleted; swept on next start.
    pub leftover: Option<PathBuf>,
}

type RenameFn = fn(&Path, &Path) -> io::Result<()>;

#[derive(Debug, Clone, Copy)]
pub struct RestoreCoordinator {
    parallel_copy: bool,
    rename: RenameFn,
}

impl Default for RestoreCoordinator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RestoreCoordinator {
    pub fn new(parallel_copy: bool) -> Self {
        Self {
            parallel_copy,
            rename: |from, to| fs::rename(from, to),
        }
    }

    #[cfg(test)]
    fn with_rename(mut self, rename: RenameFn) -> Self {
        self.rename = rename;
        self
    }

    #[instrument(skip(self, store, source_root), fields(root = %source_root.display()))]
    pub fn restore(
        &self,
        store: &GenerationStore,
        source_root: &Path,
        category: &str,
        timestamp: &str,
    ) -> EngineResult<Restored> {
        let snapshot = store.find(category, timestamp)?;
        if snapshot.corrupted {
            return Err(EngineError::CorruptedSnapshot {
                category: category.to_string(),
                timestamp: timestamp.to_string(),
            });
        }
        if !source_root.is_dir() {
            return Err(EngineError::io(
                format!("restore '{category}'"),
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("watched root {} does not exist", source_root.display()),
                ),
            ));
        }

        let live = source_root.join(category);

        // 1. Stage
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(source_root)
            .io_context(|| format!("create restore staging in {}", source_root.display()))?;
        let stats = copy_tree(&snapshot.path, staging.path(), self.parallel_copy)
            .io_context(|| format!("stage snapshot {timestamp} of '{category}'"))?;

        // 2. Retire the current live folder
        let retired = if live.exists() {
            let retired = source_root.join(retired_name(category));
            (self.rename)(&live, &retired).map_err(|source| EngineError::SourceLocked {
                category: category.to_string(),
                source,
            })?;
            Some(retired)
        } else {
            None
        };

        // 3. Swap in
        if let Err(swap_err) = (self.rename)(staging.path(), &live) {
            let Some(retired) = retired else {
                return Err(EngineError::io(
                    format!("move restored '{category}' into place"),
                    swap_err,
                ));
            };
            return match (self.rename)(&retired, &live) {
                Ok(()) => Err(EngineError::SourceLocked {
                    category: category.to_string(),
                    source: swap_err,
                }),
                Err(rollback_err) => {
                    error!(
                        retired = %retired.display(),
                        error = %rollback_err,
                        "rollback failed; live folder is missing"
                    );
                    Err(EngineError::PartialFailure {
                        category: category.to_string(),
                        detail: format!(
                            "restore could not be completed ({swap_err}) and the previous \
                             content could not be put back ({rollback_err}); it remains at {}",
                            retired.display()
                        ),
                    })
                }
            };
        }
        drop(staging);
        let _ = sync_dir(source_root);

        // 4. Permanently delete the old content
        let leftover = retired.and_then(|retired| match remove_tree_verified(&retired) {
            Removal::Removed => None,
            Removal::Untouched(e) | Removal::Partial { error: e, .. } => {
                warn!(path = %retired.display(), error = %e, "previous live content not fully removed");
                Some(retired)
            }
        });

        info!(files = stats.files, bytes = stats.bytes, "restore complete");
        Ok(Restored { stats, leftover })
    }
}

fn retired_name(category: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{RETIRED_PREFIX}{category}-{}-{nanos}", std::process::id())
}

/// Remove staging and retired trees left in the watched root by an
/// interrupted restore. Returns how many were removed.
pub fn sweep_leftovers(source_root: &Path) -> usize {
    let Ok(read) = fs::read_dir(source_root) else {
        return 0;
    };
    let mut swept = 0;
    for entry in read.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(STAGING_PREFIX) || name.starts_with(RETIRED_PREFIX)) {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => swept += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "cannot sweep restore leftover"),
        }
    }
    if swept > 0 {
        info!(swept, "removed interrupted restore leftovers");
    }
    swept
}
