//! Filepath: src/infra/walk.rs
//! Full-tree walker and path filters for save folders.
//! - Every entry is visited: no .gitignore, hidden-file or type filtering,
//!   since a save folder must be copied byte-for-byte
//! - Symlinks are not followed during traversal; their targets are copied
//! - Deterministic ordering for stable fingerprints and tests
//!
//! Backed by ripgrep's `ignore` crate (with its standard filters off) and
//! `globset` for the watcher's "never triggers a backup" patterns.

use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;

/// What a walked entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

/// One entry below the walk root.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Path relative to the walk root (never empty)
    pub rel_path: PathBuf,

    /// Absolute path on disk
    pub path: PathBuf,

    pub kind: EntryKind,
}

/// Unfiltered walker over a directory tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeWalker;

impl TreeWalker {
    pub fn new() -> Self {
        Self
    }

    /// Internal: construct a configured WalkBuilder for `root`.
    fn build_walk(&self, root: &Path) -> WalkBuilder {
        let mut b = WalkBuilder::new(root);

        // Turn off every ignore source: hidden, .ignore, .gitignore, git
        // exclude/global and parent lookups.
        b.standard_filters(false);
        b.follow_links(false);
        b.sort_by_file_name(|a, b| a.cmp(b));

        b
    }

    /// Every entry under `root` (the root itself excluded), sorted by path.
    /// The first I/O error aborts the walk.
    pub fn entries(&self, root: &Path) -> io::Result<Vec<TreeEntry>> {
        let mut out = Vec::new();

        for res in self.build_walk(root).build() {
            let entry = res.map_err(walk_error)?;
            if entry.depth() == 0 {
                continue;
            }

            let Some(ft) = entry.file_type() else {
                continue;
            };
            let kind = if ft.is_dir() {
                EntryKind::Dir
            } else if ft.is_symlink() {
                EntryKind::Symlink
            } else {
                EntryKind::File
            };

            let rel_path = entry
                .path()
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .to_path_buf();

            out.push(TreeEntry {
                rel_path,
                path: entry.into_path(),
                kind,
            });
        }

        out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(out)
    }
}

fn walk_error(err: ignore::Error) -> io::Error {
    let msg = err.to_string();
    err.into_io_error()
        .unwrap_or_else(|| io::Error::other(msg))
}

/// Paths (relative to the watched root) whose changes never trigger a backup.
#[derive(Debug, Clone)]
pub struct PathFilter {
    /// Compiled set of ignore patterns
    patterns: GlobSet,
}

impl PathFilter {
    /// Build from glob patterns such as `"**/*.tmp"`.
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            patterns: builder.build()?,
        })
    }

    /// Filter that matches nothing.
    pub fn empty() -> Self {
        Self {
            patterns: GlobSet::empty(),
        }
    }

    pub fn is_ignored(&self, rel_path: &Path) -> bool {
        self.patterns.is_match(rel_path)
    }
}
