//! Externally visible state and the outbound notification interface.
//!
//! Every broadcast is a full document (never a diff), so the newest one a
//! consumer receives supersedes everything before it.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::generation::{GenerationStore, validate_category};
use crate::core::settings::Settings;
use crate::infra::io::subdirectories;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub timestamp: String,
    pub is_auto: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub corrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryState {
    pub name: String,
    /// Newest first.
    pub snapshots: Vec<SnapshotState>,
    pub latest: Option<String>,
    pub memo: String,
    pub source_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl UserEvent {
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
            category: None,
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, title, message)
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Success, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, title, message)
    }

    pub fn for_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Outbound side of the engine. Calls are fire-and-forget and may arrive
/// from any engine thread.
pub trait Notifier: Send + Sync {
    fn settings_changed(&self, settings: &Settings);
    fn categories_changed(&self, categories: &[CategoryState]);
    fn user_event(&self, event: &UserEvent);
}

/// Logs every broadcast.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn settings_changed(&self, settings: &Settings) {
        info!(
            path = %settings.repo_save_path,
            max_generations = settings.max_generations,
            theme = %settings.theme,
            "settings-state"
        );
    }

    fn categories_changed(&self, categories: &[CategoryState]) {
        for c in categories {
            info!(
                category = %c.name,
                snapshots = c.snapshots.len(),
                latest = c.latest.as_deref().unwrap_or("-"),
                source_exists = c.source_exists,
                "backups-state"
            );
        }
    }

    fn user_event(&self, event: &UserEvent) {
        match event.severity {
            Severity::Error => warn!(title = %event.title, category = ?event.category, "{}", event.message),
            _ => info!(title = %event.title, category = ?event.category, "{}", event.message),
        }
    }
}

/// Writes one JSON object per broadcast: `{"event": ..., "payload": ...}`.
pub struct JsonLinesNotifier<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesNotifier<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    fn write<T: Serialize + ?Sized>(&self, event: &str, payload: &T) {
        #[derive(Serialize)]
        struct Line<'a, T: ?Sized> {
            event: &'a str,
            payload: &'a T,
        }

        let line = match serde_json::to_string(&Line { event, payload }) {
            Ok(l) => l,
            Err(e) => {
                warn!(event, error = %e, "cannot encode notification");
                return;
            }
        };
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            warn!(error = %e, "cannot write notification");
        }
    }
}

impl<W: Write + Send> Notifier for JsonLinesNotifier<W> {
    fn settings_changed(&self, settings: &Settings) {
        self.write("settings-state", settings);
    }

    fn categories_changed(&self, categories: &[CategoryState]) {
        self.write("backups-state", categories);
    }

    fn user_event(&self, event: &UserEvent) {
        self.write("show-notification", event);
    }
}

/// One recorded broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Settings(Settings),
    Categories(Vec<CategoryState>),
    Event(UserEvent),
}

/// Keeps every broadcast in memory. Used by tests and embedders that poll.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    log: Mutex<Vec<Recorded>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Recorded> {
        self.log.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn events(&self) -> Vec<UserEvent> {
        self.all()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn last_categories(&self) -> Option<Vec<CategoryState>> {
        self.all().into_iter().rev().find_map(|r| match r {
            Recorded::Categories(c) => Some(c),
            _ => None,
        })
    }

    pub fn last_settings(&self) -> Option<Settings> {
        self.all().into_iter().rev().find_map(|r| match r {
            Recorded::Settings(s) => Some(s),
            _ => None,
        })
    }

    fn push(&self, r: Recorded) {
        self.log.lock().unwrap_or_else(|p| p.into_inner()).push(r);
    }
}

impl Notifier for RecordingNotifier {
    fn settings_changed(&self, settings: &Settings) {
        self.push(Recorded::Settings(settings.clone()));
    }

    fn categories_changed(&self, categories: &[CategoryState]) {
        self.push(Recorded::Categories(categories.to_vec()));
    }

    fn user_event(&self, event: &UserEvent) {
        self.push(Recorded::Event(event.clone()));
    }
}

/// Computes and broadcasts full-state documents.
pub struct StatePublisher {
    notifier: Arc<dyn Notifier>,
    /// Held while a categories document is computed and sent, so two
    /// concurrent refreshes cannot deliver an older view last.
    gate: Mutex<()>,
}

impl StatePublisher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            gate: Mutex::new(()),
        }
    }

    /// Union of archived categories and live subfolders, sorted by name.
    /// A category is listed while its source exists or it has snapshots.
    pub fn collect(store: &GenerationStore, root: Option<&Path>) -> Vec<CategoryState> {
        let mut names = store.categories().unwrap_or_else(|e| {
            warn!(error = %e, "cannot list archive");
            Vec::new()
        });
        if let Some(root) = root {
            match subdirectories(root) {
                Ok(live) => names.extend(live.into_iter().filter(|n| validate_category(n).is_ok())),
                Err(e) => warn!(root = %root.display(), error = %e, "cannot list watched root"),
            }
        }
        names.sort();
        names.dedup();

        names
            .into_iter()
            .filter_map(|name| {
                let source_exists = root.is_some_and(|r| r.join(&name).is_dir());
                let snapshots = store.list(&name).unwrap_or_else(|e| {
                    warn!(category = %name, error = %e, "cannot list snapshots");
                    Vec::new()
                });
                if !source_exists && snapshots.is_empty() {
                    return None;
                }
                let memo = store.memo(&name).unwrap_or_default();
                let snapshots: Vec<SnapshotState> = snapshots
                    .into_iter()
                    .map(|s| SnapshotState {
                        timestamp: s.id.to_string(),
                        is_auto: s.is_auto,
                        corrupted: s.corrupted,
                    })
                    .collect();
                Some(CategoryState {
                    latest: snapshots.first().map(|s| s.timestamp.clone()),
                    name,
                    snapshots,
                    memo,
                    source_exists,
                })
            })
            .collect()
    }

    pub fn publish_categories(&self, store: &GenerationStore, root: Option<&Path>) {
        let _gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
        let state = Self::collect(store, root);
        self.notifier.categories_changed(&state);
    }

    pub fn publish_settings(&self, settings: &Settings) {
        self.notifier.settings_changed(settings);
    }

    pub fn emit(&self, event: UserEvent) {
        self.notifier.user_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn collect_merges_archive_and_live() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("saves");
        for name in ["SaveA", "SaveB", ".svault-staging-x"] {
            fs::create_dir_all(root.join(name)).unwrap();
        }
        fs::write(root.join("SaveA/a.sav"), "a").unwrap();
        let store = GenerationStore::new(tmp.path().join("archive"), Arc::new(SystemClock));
        let snap = store.create(&root, "SaveA", true, 10).unwrap().snapshot;
        store.set_memo("SaveA", "hello").unwrap();

        // Archived, live folder gone
        fs::create_dir_all(root.join("Old")).unwrap();
        store.create(&root, "Old", false, 10).unwrap();
        fs::remove_dir_all(root.join("Old")).unwrap();

        // Memo only, live folder gone: hidden
        store.set_memo("Ghost", "x").unwrap();

        let state = StatePublisher::collect(&store, Some(&root));
        let names: Vec<_> = state.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Old", "SaveA", "SaveB"]);

        let a = &state[1];
        assert_eq!(a.latest.as_deref(), Some(snap.id.as_str()));
        assert_eq!(a.memo, "hello");
        assert!(a.snapshots[0].is_auto);
        assert!(a.source_exists);
        assert!(!state[0].source_exists);
        assert!(state[2].snapshots.is_empty());
    }

    #[test]
    fn json_lines_shape() {
        let notifier = JsonLinesNotifier::new(Vec::new());
        notifier.user_event(&UserEvent::success("Backup created", "SaveA").for_category("SaveA"));
        let out = notifier.out.into_inner().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["event"], "show-notification");
        assert_eq!(v["payload"]["severity"], "success");
        assert_eq!(v["payload"]["category"], "SaveA");
    }
}
