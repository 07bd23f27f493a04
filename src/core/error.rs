//! Error taxonomy for engine operations.
//!
//! Every store, restore and scheduler failure is an [`EngineError`]. The
//! scheduler turns them into user events at its boundary; [`ErrorKind`] is
//! the coarse class used for that mapping.

use std::path::PathBuf;

/// Coarse error class, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Live folder absent; surfaces as `source_exists = false`.
    SourceMissing,
    /// Request rejected before touching the filesystem.
    Rejected,
    /// Referenced snapshot or category absent.
    NotFound,
    /// Generic filesystem failure.
    Io,
    /// Live content could not be replaced; it is unchanged.
    SourceLocked,
    /// Operation completed only partially; state is degraded.
    PartialFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("source folder for '{category}' does not exist")]
    SourceMissing { category: String },

    #[error("snapshot {timestamp} not found in '{category}'")]
    NotFound { category: String, timestamp: String },

    #[error("no archive found for '{category}'")]
    CategoryNotFound { category: String },

    #[error("snapshot {timestamp} of '{category}' is corrupted")]
    CorruptedSnapshot { category: String, timestamp: String },

    #[error("live folder for '{category}' cannot be replaced: {source}")]
    SourceLocked {
        category: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{category}' is in a degraded state: {detail}")]
    PartialFailure { category: String, detail: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid category name: {0:?}")]
    InvalidCategory(String),

    #[error("no save folder is configured")]
    NoWatchedRoot,

    #[error("another instance (pid {pid}) owns {}", .path.display())]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("settings error: {0}")]
    Settings(String),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceMissing { .. } => ErrorKind::SourceMissing,
            Self::NotFound { .. } | Self::CategoryNotFound { .. } => ErrorKind::NotFound,
            Self::SourceLocked { .. } => ErrorKind::SourceLocked,
            Self::PartialFailure { .. } | Self::CorruptedSnapshot { .. } => {
                ErrorKind::PartialFailure
            }
            Self::Io { .. } | Self::Settings(_) | Self::Watch(_) => ErrorKind::Io,
            Self::InvalidCategory(_)
            | Self::NoWatchedRoot
            | Self::AlreadyRunning { .. }
            | Self::ShuttingDown => ErrorKind::Rejected,
        }
    }

    /// Whether the failure should reach the user as an error event.
    pub fn is_notifiable(&self) -> bool {
        self.kind() != ErrorKind::SourceMissing
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// `with_context`-style helper for `std::io::Result`.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F, S>(self, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| EngineError::io(f(), e))
    }
}
