//! Engine facade: the inbound operations of the backup engine.
//!
//! ```text
//! notify ─► DebouncedWatcher ─► dispatcher ─► Scheduler lanes ─► GenerationStore
//!                                                   │                 RestoreCoordinator
//! request_* / update_settings ──────────────────────┘
//!                                                   └─► StatePublisher ─► Notifier
//! ```
//!
//! The engine owns the single-instance lock for its data directory for as
//! long as it lives.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, instrument, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::core::error::{EngineError, EngineResult, IoContext};
use crate::core::generation::GenerationStore;
use crate::core::publisher::{CategoryState, Notifier, StatePublisher, TracingNotifier, UserEvent};
use crate::core::restore::{RestoreCoordinator, sweep_leftovers};
use crate::core::scheduler::{Operation, Scheduler, SchedulerContext, Ticket};
use crate::core::settings::{Settings, SettingsCoordinator, SettingsStore};
use crate::core::watcher::{DebouncedWatcher, SessionGate, Tagged, WatchOptions, WatchSignal};
use crate::infra::config::{EngineConfig, EnginePaths};
use crate::infra::lock::InstanceLock;

pub struct EngineBuilder {
    paths: EnginePaths,
    config: EngineConfig,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn new(paths: EnginePaths) -> Self {
        Self {
            paths,
            config: EngineConfig::default(),
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Take the instance lock and load settings. Nothing is watched until
    /// [`Engine::initialize`].
    pub fn open(self) -> EngineResult<Engine> {
        let Self {
            paths,
            config,
            notifier,
            clock,
        } = self;

        fs::create_dir_all(&paths.archive_dir)
            .io_context(|| format!("create archive: {}", paths.archive_dir.display()))?;
        let lock = InstanceLock::acquire(&paths.lock_file)?;

        let filter = config
            .path_filter()
            .map_err(|e| EngineError::Settings(format!("{e:#}")))?;

        let ctx = Arc::new(SchedulerContext {
            store: GenerationStore::new(&paths.archive_dir, clock)
                .with_parallel_copy(config.parallel_copy),
            restorer: RestoreCoordinator::new(config.parallel_copy),
            publisher: StatePublisher::new(notifier),
            settings: SettingsCoordinator::load(SettingsStore::new(&paths.settings_file)),
            restore_mute: config.restore_mute(),
        });
        let scheduler = Arc::new(Scheduler::new(ctx));

        let (signals, rx) = mpsc::sync_channel(config.event_queue_capacity.max(1));
        let watcher = DebouncedWatcher::new(WatchOptions::from_config(&config, filter), signals);
        let gate = watcher.gate();

        let dispatch_scheduler = Arc::clone(&scheduler);
        let dispatcher = thread::Builder::new()
            .name("svault-dispatch".into())
            .spawn(move || dispatch(dispatch_scheduler, gate, rx))
            .io_context(|| "start dispatcher thread")?;

        info!(data_dir = %paths.data_dir.display(), "engine opened");
        Ok(Engine {
            scheduler,
            watcher: Mutex::new(Some(watcher)),
            dispatcher: Mutex::new(Some(dispatcher)),
            initialized: AtomicBool::new(false),
            settings_gate: Mutex::new(()),
            _lock: lock,
        })
    }
}

pub struct Engine {
    scheduler: Arc<Scheduler>,
    watcher: Mutex<Option<DebouncedWatcher>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
    /// Serializes settings changes.
    settings_gate: Mutex<()>,
    _lock: InstanceLock,
}

impl Engine {
    pub fn builder(paths: EnginePaths) -> EngineBuilder {
        EngineBuilder::new(paths)
    }

    fn ctx(&self) -> &SchedulerContext {
        self.scheduler.context()
    }

    fn watcher(&self) -> MutexGuard<'_, Option<DebouncedWatcher>> {
        self.watcher.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Clean crash leftovers, publish both documents and start watching.
    /// Calling it again republishes and is otherwise a no-op.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> EngineResult<()> {
        if !self.scheduler.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        let _gate = self.settings_gate.lock().unwrap_or_else(|p| p.into_inner());
        let ctx = self.ctx();
        let root = ctx.root();

        if !self.initialized.swap(true, Ordering::SeqCst) {
            ctx.store.sweep_partials();
            if let Some(root) = &root {
                sweep_leftovers(root);
            }
        }

        if let Some(root) = &root
            && let Some(w) = self.watcher().as_mut()
        {
            w.start(root);
        }

        ctx.publisher.publish_settings(&ctx.settings.current());
        ctx.publish_categories();
        Ok(())
    }

    /// Apply new settings: clamp, stop the watcher if the root changes,
    /// persist, restart, prune when retention shrank, publish.
    #[instrument(skip(self))]
    pub fn update_settings(
        &self,
        path: &str,
        max_generations: i64,
        theme: &str,
    ) -> EngineResult<Settings> {
        if !self.scheduler.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        let _gate = self.settings_gate.lock().unwrap_or_else(|p| p.into_inner());
        let ctx = self.ctx();
        let change = ctx.settings.prepare(path, max_generations, theme);
        let root_changed = change.root_changed();

        if root_changed && let Some(w) = self.watcher().as_mut() {
            w.stop();
        }

        let committed = ctx.settings.commit(&change);
        let running = self.initialized.load(Ordering::SeqCst);
        // On failure the old settings stay; put the old watcher back.
        let active = match &committed {
            Ok(s) => s.clone(),
            Err(_) => change.previous.clone(),
        };
        if running && let Some(root) = active.watched_root() {
            if root_changed {
                sweep_leftovers(&root);
            }
            if let Some(w) = self.watcher().as_mut() {
                w.start(&root);
            }
        }
        let settings = committed?;

        if let Some(limit) = change.shrunk_to() {
            self.prune_all(limit);
        }

        ctx.publisher.publish_settings(&settings);
        ctx.publish_categories();
        Ok(settings)
    }

    /// Queue a retention pass on every archived category and wait for all.
    fn prune_all(&self, limit: usize) {
        let categories = match self.ctx().store.categories() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "cannot list categories for pruning");
                return;
            }
        };
        let tickets: Vec<(String, Ticket)> = categories
            .into_iter()
            .map(|c| {
                let t = self.scheduler.submit(&c, Operation::Prune { limit });
                (c, t)
            })
            .collect();
        for (category, ticket) in tickets {
            if let Err(e) = ticket.wait() {
                warn!(category, error = %e, "prune failed");
            }
        }
        info!(limit, "retention reapplied");
    }

    #[instrument(skip(self))]
    pub fn request_backup(&self, category: &str) -> Ticket {
        self.scheduler
            .submit(category, Operation::Backup { is_auto: false })
    }

    #[instrument(skip(self))]
    pub fn request_restore(&self, category: &str, timestamp: &str) -> Ticket {
        self.scheduler.submit(
            category,
            Operation::Restore {
                timestamp: timestamp.to_string(),
            },
        )
    }

    #[instrument(skip(self))]
    pub fn delete_snapshot(&self, category: &str, timestamp: &str) -> Ticket {
        self.scheduler.submit(
            category,
            Operation::DeleteOne {
                timestamp: timestamp.to_string(),
            },
        )
    }

    #[instrument(skip(self))]
    pub fn delete_category(&self, category: &str) -> Ticket {
        self.scheduler.submit(category, Operation::DeleteAll)
    }

    #[instrument(skip(self, text))]
    pub fn set_memo(&self, category: &str, text: &str) -> Ticket {
        self.scheduler.submit(
            category,
            Operation::SetMemo {
                text: text.to_string(),
            },
        )
    }

    pub fn settings(&self) -> Settings {
        self.ctx().settings.current()
    }

    pub fn categories(&self) -> Vec<CategoryState> {
        let ctx = self.ctx();
        StatePublisher::collect(&ctx.store, ctx.root().as_deref())
    }

    /// Root the watcher is currently subscribed to (or retrying).
    pub fn watching(&self) -> Option<PathBuf> {
        self.watcher()
            .as_ref()
            .and_then(|w| w.root().map(|p| p.to_path_buf()))
    }

    /// Block until no operation is queued or running.
    pub fn wait_idle(&self) {
        self.scheduler.wait_idle();
    }

    /// Stop watching, let queued work finish, stop the dispatcher.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        // Dropping the watcher drops the last signal sender.
        if let Some(mut w) = self.watcher().take() {
            w.stop();
        }
        self.scheduler.shutdown();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("dispatcher panicked");
        }
        debug!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Route watcher signals into the scheduler. Signals from a watcher
/// session that has since been stopped or restarted are dropped.
fn dispatch(scheduler: Arc<Scheduler>, gate: SessionGate, rx: Receiver<Tagged>) {
    for Tagged { session, signal } in rx {
        if !gate.is_current(session) {
            debug!(session, ?signal, "stale watcher signal dropped");
            continue;
        }
        let ctx = scheduler.context();
        match signal {
            WatchSignal::Settled { category, .. } => {
                // Fire and forget; the lane reports the result.
                let _ = scheduler.submit(&category, Operation::Backup { is_auto: true });
            }
            WatchSignal::Rescan { .. } => ctx.publish_categories(),
            WatchSignal::Unavailable {
                root,
                error,
                retry_in,
            } => {
                ctx.publisher.emit(UserEvent::error(
                    "Watcher unavailable",
                    format!(
                        "{}: {error} (retrying in {}s)",
                        root.display(),
                        retry_in.as_secs().max(1)
                    ),
                ));
            }
            WatchSignal::Subscribed { root } => {
                info!(root = %root.display(), session, "watching");
            }
        }
    }
    debug!("dispatcher finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::publisher::RecordingNotifier;
    use tempfile::TempDir;

    fn engine(tmp: &TempDir) -> (Engine, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = Engine::builder(EnginePaths::new(tmp.path().join("data")))
            .with_notifier(notifier.clone())
            .open()
            .unwrap();
        (engine, notifier)
    }

    #[test]
    fn second_engine_on_same_data_dir_is_refused() {
        let tmp = TempDir::new().unwrap();
        let (first, _) = engine(&tmp);
        let err = Engine::builder(EnginePaths::new(tmp.path().join("data")))
            .open()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::AlreadyRunning { .. }));
        drop(first);
        let (_again, _) = engine(&tmp);
    }

    #[test]
    fn backup_without_root_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (engine, notifier) = engine(&tmp);
        engine.initialize().unwrap();
        assert_eq!(engine.watching(), None);

        let err = engine.request_backup("SaveA").wait().unwrap_err();
        assert!(matches!(*err, EngineError::NoWatchedRoot));
        assert_eq!(notifier.events().last().unwrap().title, "Backup failed");
    }

    #[test]
    fn initialize_publishes_both_documents() {
        let tmp = TempDir::new().unwrap();
        let (engine, notifier) = engine(&tmp);
        engine.initialize().unwrap();
        assert_eq!(notifier.last_settings(), Some(Settings::default()));
        assert_eq!(notifier.last_categories(), Some(Vec::new()));
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let tmp = TempDir::new().unwrap();
        let (engine, _) = engine(&tmp);
        engine.shutdown();
        engine.shutdown();
        let err = engine.request_backup("SaveA").wait().unwrap_err();
        assert!(matches!(*err, EngineError::ShuttingDown));
    }
}
