//! Debounced watcher over the watched root.
//!
//! `notify` delivers raw events on its own thread; the callback only does a
//! non-blocking `try_send` into a bounded queue. A dedicated debounce thread
//! maps each event to its category (the first path component below the
//! root) and keeps one deadline per category. Every new event pushes the
//! deadline out by the debounce window; when a deadline passes, one
//! [`WatchSignal::Settled`] goes to the engine.
//!
//! If the root cannot be subscribed (missing, permission denied) the thread
//! reports [`WatchSignal::Unavailable`] once per failure streak and retries
//! with exponential backoff until the root appears or the watcher stops.
//!
//! Every `start` opens a new session. Signals carry the session that sent
//! them, and [`SessionGate`] tells the receiver which session is live, so
//! intents queued by a stopped watcher can be told apart from current ones
//! without comparing paths.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::event::{EventKind, ModifyKind};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::core::generation::validate_category;
use crate::infra::config::EngineConfig;
use crate::infra::walk::PathFilter;

/// Live watcher session, shared between the watcher and whoever consumes
/// its signals.
#[derive(Debug, Clone, Default)]
pub struct SessionGate(Arc<AtomicU64>);

impl SessionGate {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, session: u64) -> bool {
        self.current() == session
    }

    fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A signal and the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged {
    pub session: u64,
    pub signal: WatchSignal,
}

/// What the watcher tells the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    /// A burst of changes in `category` has ended.
    Settled { root: PathBuf, category: String },
    /// Category folders may have appeared or disappeared.
    Rescan { root: PathBuf },
    /// Subscription failed; retrying after `retry_in`.
    Unavailable {
        root: PathBuf,
        error: String,
        retry_in: Duration,
    },
    /// Subscription (re)established.
    Subscribed { root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub queue_capacity: usize,
    pub filter: PathFilter,
}

impl WatchOptions {
    pub fn from_config(cfg: &EngineConfig, filter: PathFilter) -> Self {
        Self {
            debounce: cfg.debounce(),
            backoff_initial: cfg.backoff_initial(),
            backoff_max: cfg.backoff_max(),
            queue_capacity: cfg.event_queue_capacity.max(1),
            filter,
        }
    }
}

/// Shortest re-arm delay when the engine queue is full.
const RETRY_FLOOR: Duration = Duration::from_millis(10);

enum Msg {
    Raw(Event),
    Error(notify::Error),
    Stop,
}

struct Running {
    root: PathBuf,
    control: SyncSender<Msg>,
    handle: JoinHandle<()>,
}

/// Owner of the watch thread. `start` and `stop` are idempotent.
pub struct DebouncedWatcher {
    options: WatchOptions,
    signals: SyncSender<Tagged>,
    gate: SessionGate,
    running: Option<Running>,
}

impl DebouncedWatcher {
    pub fn new(options: WatchOptions, signals: SyncSender<Tagged>) -> Self {
        Self {
            options,
            signals,
            gate: SessionGate::default(),
            running: None,
        }
    }

    /// Handle for checking whether a received signal is still live.
    pub fn gate(&self) -> SessionGate {
        self.gate.clone()
    }

    /// Watch `root`. Already watching `root` is a no-op; watching another
    /// root stops that one first (dropping its pending intents).
    pub fn start(&mut self, root: &Path) {
        if self.root() == Some(root) {
            return;
        }
        self.stop();

        let session = self.gate.advance();
        let (control, rx) = mpsc::sync_channel(self.options.queue_capacity);
        let ctx = WatchThread {
            session,
            root: root.to_path_buf(),
            options: self.options.clone(),
            signals: self.signals.clone(),
            inbox: control.clone(),
            overflowed: Arc::new(AtomicBool::new(false)),
        };
        let handle = thread::Builder::new()
            .name("svault-watch".into())
            .spawn(move || ctx.run(rx));

        match handle {
            Ok(handle) => {
                info!(root = %root.display(), session, "watcher started");
                self.running = Some(Running {
                    root: root.to_path_buf(),
                    control,
                    handle,
                });
            }
            Err(e) => {
                let _ = self.signals.try_send(Tagged {
                    session,
                    signal: WatchSignal::Unavailable {
                        root: root.to_path_buf(),
                        error: format!("cannot spawn watch thread: {e}"),
                        retry_in: Duration::ZERO,
                    },
                });
            }
        }
    }

    /// Tear down the subscription and wait for the thread to exit. Pending
    /// intents are discarded.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        // Anything this session still has queued is now stale.
        self.gate.advance();
        // Blocking send: the thread keeps draining until it sees Stop.
        let _ = running.control.send(Msg::Stop);
        if running.handle.join().is_err() {
            warn!(root = %running.root.display(), "watch thread panicked");
        }
        info!(root = %running.root.display(), "watcher stopped");
    }

    pub fn root(&self) -> Option<&Path> {
        self.running.as_ref().map(|r| r.root.as_path())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for DebouncedWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How one debounce session ended.
enum Exit {
    Stop,
    Lost(String),
}

struct WatchThread {
    session: u64,
    /// Root as configured; may be a symlink or not exist yet.
    root: PathBuf,
    options: WatchOptions,
    signals: SyncSender<Tagged>,
    inbox: SyncSender<Msg>,
    overflowed: Arc<AtomicBool>,
}

impl WatchThread {
    fn run(self, rx: Receiver<Msg>) {
        let mut backoff = self.options.backoff_initial;
        let mut failing = false;

        loop {
            let error = match self.subscribe() {
                Ok((watcher, target)) => {
                    failing = false;
                    backoff = self.options.backoff_initial;
                    self.signal(WatchSignal::Subscribed {
                        root: self.root.clone(),
                    });
                    self.signal(WatchSignal::Rescan {
                        root: self.root.clone(),
                    });
                    let exit = self.debounce_loop(&rx, &target);
                    drop(watcher);
                    match exit {
                        Exit::Stop => return,
                        Exit::Lost(e) => e,
                    }
                }
                Err(e) => e.to_string(),
            };

            if !failing {
                warn!(root = %self.root.display(), error = %error, retry_in = ?backoff, "watch unavailable");
                self.signal(WatchSignal::Unavailable {
                    root: self.root.clone(),
                    error,
                    retry_in: backoff,
                });
                // The root may have vanished with its categories.
                self.signal(WatchSignal::Rescan {
                    root: self.root.clone(),
                });
            } else {
                debug!(root = %self.root.display(), error = %error, retry_in = ?backoff, "watch retry failed");
            }
            failing = true;

            if self.sleep(&rx, backoff) {
                return;
            }
            backoff = (backoff * 2).min(self.options.backoff_max);
        }
    }

    /// Subscribe to the resolved root. Returns the path events will be
    /// reported under.
    fn subscribe(&self) -> notify::Result<(RecommendedWatcher, PathBuf)> {
        if !self.root.is_dir() {
            return Err(notify::Error::path_not_found().add_path(self.root.clone()));
        }
        // Resolved now rather than at start: the root or one of its parents
        // may have been created since.
        let target = dunce::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let inbox = self.inbox.clone();
        let overflowed = Arc::clone(&self.overflowed);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let msg = match res {
                Ok(event) => Msg::Raw(event),
                Err(e) => Msg::Error(e),
            };
            if let Err(TrySendError::Full(_)) = inbox.try_send(msg) {
                overflowed.store(true, Ordering::Relaxed);
            }
        })?;
        watcher.watch(&target, RecursiveMode::Recursive)?;
        debug!(root = %self.root.display(), target = %target.display(), "subscribed");
        Ok((watcher, target))
    }

    /// Wait out a backoff period. Returns true when asked to stop.
    fn sleep(&self, rx: &Receiver<Msg>, period: Duration) -> bool {
        let until = Instant::now() + period;
        loop {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            match rx.recv_timeout(left) {
                Ok(Msg::Stop) | Err(RecvTimeoutError::Disconnected) => return true,
                // Stale events from a dropped subscription
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }

    fn debounce_loop(&self, rx: &Receiver<Msg>, target: &Path) -> Exit {
        let mut pending: HashMap<String, Instant> = HashMap::new();
        let mut rescan = false;

        loop {
            let next_due = pending.values().min().copied();
            let msg = match next_due {
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(due) => rx.recv_timeout(due.saturating_duration_since(Instant::now())),
            };

            match msg {
                Ok(Msg::Raw(event)) => {
                    let c = classify(target, &self.options.filter, &event);
                    if c.root_lost {
                        return Exit::Lost("watched root was removed".into());
                    }
                    rescan |= c.rescan;
                    let deadline = Instant::now() + self.options.debounce;
                    for category in c.categories {
                        pending.insert(category, deadline);
                    }
                }
                Ok(Msg::Error(e)) => {
                    if !self.root.is_dir() {
                        return Exit::Lost(e.to_string());
                    }
                    warn!(root = %self.root.display(), error = %e, "watch error");
                }
                Ok(Msg::Stop) | Err(RecvTimeoutError::Disconnected) => return Exit::Stop,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self.overflowed.swap(false, Ordering::Relaxed) {
                // Events were lost; every category may have changed.
                warn!(root = %self.root.display(), "event queue overflowed, rescheduling all categories");
                let deadline = Instant::now() + self.options.debounce;
                for category in live_categories(target) {
                    pending.insert(category, deadline);
                }
                rescan = true;
            }

            if rescan {
                rescan = !self.signal(WatchSignal::Rescan {
                    root: self.root.clone(),
                });
            }

            let now = Instant::now();
            let due: Vec<String> = pending
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(c, _)| c.clone())
                .collect();
            for category in due {
                pending.remove(&category);
                let tagged = Tagged {
                    session: self.session,
                    signal: WatchSignal::Settled {
                        root: self.root.clone(),
                        category,
                    },
                };
                match self.signals.try_send(tagged) {
                    Ok(()) => {}
                    Err(TrySendError::Full(Tagged {
                        signal: WatchSignal::Settled { category, .. },
                        ..
                    })) => {
                        // Engine is backed up; try again shortly.
                        pending.insert(category, now + (self.options.debounce / 4).max(RETRY_FLOOR));
                    }
                    Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(_)) => return Exit::Stop,
                }
            }
        }
    }

    /// Non-blocking delivery; returns whether the signal was queued.
    fn signal(&self, signal: WatchSignal) -> bool {
        self.signals
            .try_send(Tagged {
                session: self.session,
                signal,
            })
            .is_ok()
    }
}

/// Effect of one raw event.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Classified {
    pub categories: Vec<String>,
    pub rescan: bool,
    pub root_lost: bool,
}

pub(crate) fn classify(root: &Path, filter: &PathFilter, event: &Event) -> Classified {
    let mut out = Classified::default();
    if matches!(event.kind, EventKind::Access(_)) {
        return out;
    }
    let removed = matches!(event.kind, EventKind::Remove(_));
    let renamed = matches!(event.kind, EventKind::Modify(ModifyKind::Name(_)));

    for path in &event.paths {
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let mut parts = rel.components();
        let Some(Component::Normal(first)) = parts.next() else {
            // The root itself
            if (removed || renamed) && !root.is_dir() {
                out.root_lost = true;
            }
            continue;
        };
        let category = first.to_string_lossy().into_owned();
        if validate_category(&category).is_err() {
            continue;
        }

        let top_level = parts.next().is_none();
        if top_level {
            // A category folder itself (or a stray file beside them)
            if removed || renamed || matches!(event.kind, EventKind::Create(_)) {
                out.rescan = true;
            }
            if !removed && path.is_dir() {
                push_unique(&mut out.categories, category);
            }
            continue;
        }

        if filter.is_ignored(rel) {
            continue;
        }
        push_unique(&mut out.categories, category);
    }
    out
}

fn push_unique(v: &mut Vec<String>, s: String) {
    if !v.contains(&s) {
        v.push(s);
    }
}

fn live_categories(root: &Path) -> Vec<String> {
    crate::infra::io::subdirectories(root)
        .unwrap_or_default()
        .into_iter()
        .filter(|n| validate_category(n).is_ok())
        .collect()
}
