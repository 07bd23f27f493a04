//! Filesystem primitives shared by the generation store and restore.
//!
//! All removals here are permanent (`remove_dir_all`); nothing is ever sent
//! to a recycle bin or trash folder.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

use rayon::prelude::*;
use xxhash_rust::xxh64::Xxh64;

use crate::infra::walk::{EntryKind, TreeEntry, TreeWalker};

/// Totals for a completed tree copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub dirs: usize,
    pub files: usize,
    pub bytes: u64,
}

/// Copy the contents of `src` into `dst` (created if missing).
/// Symlinks are followed for content; directories are created before any
/// file is copied so the file pass can run in parallel.
pub fn copy_tree(src: &Path, dst: &Path, parallel: bool) -> io::Result<CopyStats> {
    let entries = TreeWalker::new().entries(src)?;
    fs::create_dir_all(dst)?;

    let mut stats = CopyStats::default();
    let mut files = Vec::new();
    for entry in &entries {
        match entry.kind {
            EntryKind::Dir => {
                fs::create_dir_all(dst.join(&entry.rel_path))?;
                stats.dirs += 1;
            }
            EntryKind::File | EntryKind::Symlink => files.push(entry),
        }
    }

    let copy_one = |entry: &&TreeEntry| -> io::Result<u64> {
        fs::copy(&entry.path, dst.join(&entry.rel_path)).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("copy {}: {e}", entry.rel_path.display()),
            )
        })
    };

    let bytes: u64 = if parallel {
        files
            .par_iter()
            .map(copy_one)
            .collect::<io::Result<Vec<u64>>>()?
            .into_iter()
            .sum()
    } else {
        files
            .iter()
            .map(copy_one)
            .collect::<io::Result<Vec<u64>>>()?
            .into_iter()
            .sum()
    };

    stats.files = files.len();
    stats.bytes = bytes;
    Ok(stats)
}

/// Result of a remove-then-verify attempt.
#[derive(Debug)]
pub enum Removal {
    /// Path no longer exists.
    Removed,
    /// Nothing was deleted; the tree is intact.
    Untouched(io::Error),
    /// Some entries were deleted, others remain.
    Partial { remaining: usize, error: io::Error },
}

/// Permanently delete `path` and verify it is gone.
pub fn remove_tree_verified(path: &Path) -> Removal {
    if !path.exists() {
        return Removal::Removed;
    }
    let before = count_entries(path);

    match fs::remove_dir_all(path) {
        Ok(()) if !path.exists() => Removal::Removed,
        Ok(()) => Removal::Partial {
            remaining: count_entries(path),
            error: io::Error::other("directory still present after removal"),
        },
        Err(_) if !path.exists() => Removal::Removed,
        Err(error) => {
            let remaining = count_entries(path);
            if remaining < before {
                Removal::Partial { remaining, error }
            } else {
                Removal::Untouched(error)
            }
        }
    }
}

/// Number of entries under `path`, the root included; 0 if unreadable.
fn count_entries(path: &Path) -> usize {
    if !path.exists() {
        return 0;
    }
    TreeWalker::new()
        .entries(path)
        .map(|e| e.len() + 1)
        .unwrap_or(0)
}

/// Order-sensitive digest of a tree's shape: relative paths, sizes and
/// modification times. Content is not read.
pub fn fingerprint(root: &Path) -> io::Result<u64> {
    let mut hasher = Xxh64::new(0);
    for entry in TreeWalker::new().entries(root)? {
        hasher.update(entry.rel_path.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        if entry.kind == EntryKind::Dir {
            continue;
        }
        let md = fs::metadata(&entry.path)?;
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        hasher.update(&md.len().to_le_bytes());
        hasher.update(&mtime.to_le_bytes());
    }
    Ok(hasher.digest())
}

/// Write `bytes` to `path` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));

    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        let _ = sync_dir(parent);
    }
    Ok(())
}

/// Names of the immediate subdirectories of `dir`, sorted. Missing `dir`
/// yields an empty list.
pub fn subdirectories(dir: &Path) -> io::Result<Vec<String>> {
    let read = match fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut out = Vec::new();
    for entry in read {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    out.sort();
    Ok(out)
}

/// Cross-platform directory fsync helper.
#[cfg(unix)]
pub fn sync_dir(p: &Path) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let f = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(p)?;
    f.sync_all()
}

#[cfg(windows)]
pub fn sync_dir(_p: &Path) -> io::Result<()> {
    // Windows does not expose a reliable directory fsync; best-effort no-op.
    Ok(())
}
