//! Per-category sidecar (`meta.json`): the memo plus per-snapshot facts that
//! a directory listing cannot tell (auto vs manual, source fingerprint,
//! corruption).
//!
//! Files written by older builds that only carry `{"memo": "..."}` load fine.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::{EngineResult, IoContext};
use crate::infra::io::write_atomic;

pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    #[serde(default)]
    pub is_auto: bool,
    /// Source tree fingerprint taken just before the copy started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<u64>,
    /// Set when a delete or prune removed only part of the snapshot.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub corrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryMeta {
    #[serde(default)]
    pub memo: String,
    #[serde(default)]
    pub snapshots: BTreeMap<String, SnapshotMeta>,
}

/// Reads and writes one category's sidecar.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(category_dir: &Path) -> Self {
        Self {
            path: category_dir.join(META_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable sidecars load as empty; a corrupt file is
    /// logged and ignored rather than blocking backups.
    pub fn load(&self) -> CategoryMeta {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CategoryMeta::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "unreadable metadata");
                return CategoryMeta::default();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "corrupt metadata, starting fresh");
            CategoryMeta::default()
        })
    }

    pub fn save(&self, meta: &CategoryMeta) -> EngineResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .io_context(|| format!("create category dir: {}", dir.display()))?;
        }
        let text = serde_json::to_string_pretty(meta)
            .map_err(|e| crate::core::error::EngineError::Settings(e.to_string()))?;
        write_atomic(&self.path, text.as_bytes())
            .io_context(|| format!("write metadata: {}", self.path.display()))
    }

    /// Load, apply `f`, save.
    pub fn update<F>(&self, f: F) -> EngineResult<CategoryMeta>
    where
        F: FnOnce(&mut CategoryMeta),
    {
        let mut meta = self.load();
        f(&mut meta);
        self.save(&meta)?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::new(tmp.path());
        assert_eq!(store.load(), CategoryMeta::default());
    }

    #[test]
    fn reads_memo_only_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(META_FILE), r#"{"memo":"before boss"}"#).unwrap();
        let meta = MetadataStore::new(tmp.path()).load();
        assert_eq!(meta.memo, "before boss");
        assert!(meta.snapshots.is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(META_FILE), "{not json").unwrap();
        assert_eq!(MetadataStore::new(tmp.path()).load(), CategoryMeta::default());
    }

    #[test]
    fn update_persists() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::new(&tmp.path().join("SaveA"));
        store
            .update(|m| {
                m.memo = "act 2".into();
                m.snapshots.insert(
                    "20240101_000000".into(),
                    SnapshotMeta {
                        is_auto: true,
                        fingerprint: Some(7),
                        corrupted: false,
                    },
                );
            })
            .unwrap();

        let loaded = store.load();
        assert_eq!(loaded.memo, "act 2");
        assert!(loaded.snapshots["20240101_000000"].is_auto);

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("corrupted"));
    }
}
