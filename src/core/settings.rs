//! User settings and the coordinator that applies changes to them.
//!
//! Applying a change is split in two so the engine can tear down the
//! watcher between validation and the swap:
//! [`SettingsCoordinator::prepare`] computes the clamped settings and what
//! changed, [`SettingsCoordinator::commit`] persists and publishes them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::error::{EngineError, EngineResult, IoContext};
use crate::infra::io::write_atomic;

pub const MIN_GENERATIONS: usize = 1;
pub const MAX_GENERATIONS: usize = 100;
pub const DEFAULT_GENERATIONS: usize = 10;
pub const DEFAULT_THEME: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Watched root; empty means no watcher.
    pub repo_save_path: String,
    pub max_generations: usize,
    /// Opaque to the engine.
    pub theme: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repo_save_path: String::new(),
            max_generations: DEFAULT_GENERATIONS,
            theme: DEFAULT_THEME.to_string(),
        }
    }
}

impl Settings {
    /// Expanded, canonical watched root, or `None` when unset.
    ///
    /// `~` and `$VAR` are expanded. A path that does not exist yet is
    /// returned as expanded so the watcher can wait for it to appear.
    pub fn watched_root(&self) -> Option<PathBuf> {
        let raw = self.repo_save_path.trim();
        if raw.is_empty() {
            return None;
        }
        let expanded = shellexpand::full(raw)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| shellexpand::tilde(raw).into_owned());
        let path = PathBuf::from(expanded);
        Some(dunce::canonicalize(&path).unwrap_or(path))
    }
}

/// Clamp untrusted input into the retention range.
pub fn clamp_generations(requested: i64) -> usize {
    requested.clamp(MIN_GENERATIONS as i64, MAX_GENERATIONS as i64) as usize
}

/// Durable settings record (`settings.toml`).
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file gives defaults; an unreadable one is logged and also
    /// gives defaults. Stored values are re-clamped.
    pub fn load(&self) -> Settings {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read settings, using defaults");
                return Settings::default();
            }
        };
        match toml::from_str::<Settings>(&text) {
            Ok(mut s) => {
                s.max_generations = clamp_generations(s.max_generations as i64);
                s
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "invalid settings, using defaults");
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> EngineResult<()> {
        let text = toml::to_string_pretty(settings)
            .map_err(|e| EngineError::Settings(e.to_string()))?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .io_context(|| format!("create settings dir: {}", dir.display()))?;
        }
        write_atomic(&self.path, text.as_bytes())
            .io_context(|| format!("write settings: {}", self.path.display()))
    }
}

/// A validated, not yet applied settings change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsChange {
    pub previous: Settings,
    pub next: Settings,
}

impl SettingsChange {
    pub fn root_changed(&self) -> bool {
        self.previous.watched_root() != self.next.watched_root()
    }

    /// New limit when retention shrank.
    pub fn shrunk_to(&self) -> Option<usize> {
        (self.next.max_generations < self.previous.max_generations)
            .then_some(self.next.max_generations)
    }
}

#[derive(Debug)]
pub struct SettingsCoordinator {
    store: SettingsStore,
    current: RwLock<Settings>,
}

impl SettingsCoordinator {
    /// Load persisted settings (or defaults).
    pub fn load(store: SettingsStore) -> Self {
        let current = store.load();
        info!(
            path = %current.repo_save_path,
            max_generations = current.max_generations,
            "settings loaded"
        );
        Self {
            store,
            current: RwLock::new(current),
        }
    }

    pub fn current(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn max_generations(&self) -> usize {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .max_generations
    }

    pub fn prepare(&self, path: &str, max_generations: i64, theme: &str) -> SettingsChange {
        let clamped = clamp_generations(max_generations);
        if clamped as i64 != max_generations {
            warn!(requested = max_generations, clamped, "max_generations out of range");
        }
        SettingsChange {
            previous: self.current(),
            next: Settings {
                repo_save_path: path.trim().to_string(),
                max_generations: clamped,
                theme: theme.to_string(),
            },
        }
    }

    /// Persist, then swap. The in-memory value only changes once the file
    /// is written.
    pub fn commit(&self, change: &SettingsChange) -> EngineResult<Settings> {
        self.store.save(&change.next)?;
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        *guard = change.next.clone();
        info!(
            path = %guard.repo_save_path,
            max_generations = guard.max_generations,
            theme = %guard.theme,
            "settings saved"
        );
        Ok(guard.clone())
    }
}
