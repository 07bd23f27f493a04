//! **savevault** - Generation-limited snapshots of save-data folders
//!
//! Watches one folder whose direct subfolders are independent categories,
//! keeps a bounded set of timestamped snapshots per category, and restores
//! any of them in place. One worker lane per category serializes mutations.

/// Command-line interface with clap integration
pub mod cli;

/// Shell completion generation
pub mod completion;

/// Command handlers for the `svault` binary
pub mod cli_ext {
    /// Watch, backup, restore, delete, memo, list and settings commands
    pub mod engine_cmd;
    pub use engine_cmd::ConsoleNotifier;
}

/// Backup engine - watcher, per-category scheduling, archive and restore
pub mod core {
    /// Typed engine failures and their broadcast classification
    pub mod error;
    pub use error::{EngineError, EngineResult, ErrorKind};

    /// Snapshot identifiers and injectable time
    pub mod clock;
    pub use clock::{Clock, ManualClock, SnapshotId, SystemClock};

    /// Per-category metadata document (memo, snapshot flags, fingerprints)
    pub mod metadata;

    /// Archive of snapshots with retention
    pub mod generation;
    pub use generation::{GenerationStore, Snapshot};

    /// Swap a snapshot into the live save folder
    pub mod restore;
    pub use restore::RestoreCoordinator;

    /// Persisted user settings with clamping
    pub mod settings;
    pub use settings::{Settings, SettingsCoordinator, SettingsStore};

    /// State broadcasts and user-facing notifications
    pub mod publisher;
    pub use publisher::{
        CategoryState, JsonLinesNotifier, Notifier, RecordingNotifier, StatePublisher,
        TracingNotifier, UserEvent,
    };

    /// Debounced per-category change detection
    pub mod watcher;
    pub use watcher::{DebouncedWatcher, SessionGate, Tagged, WatchSignal};

    /// Per-category serialized operation lanes
    pub mod scheduler;
    pub use scheduler::{Operation, Outcome, Scheduler, Ticket};

    /// Engine assembly and public request surface
    pub mod engine;
    pub use engine::{Engine, EngineBuilder};
}

/// Infrastructure - Configuration, filesystem I/O, locking and walking
pub mod infra {
    /// Layered engine configuration and data directory resolution
    pub mod config;
    pub use config::{EngineConfig, EnginePaths, init as config_init, load_config};

    /// Tree copy, verified removal, fingerprints and atomic writes
    pub mod io;

    /// Single-instance lock file for a data directory
    pub mod lock;
    pub use lock::InstanceLock;

    /// Full-tree walking and ignore globs
    pub mod walk;
    pub use walk::{PathFilter, TreeWalker};
}

pub use cli::{AppContext, Cli, Commands};
pub use core::{Engine, EngineBuilder, EngineError, Settings};
pub use infra::{EngineConfig, EnginePaths, load_config};
