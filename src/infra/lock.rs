//! Single-instance guard for a data directory.
//!
//! The lock is a file created with `create_new` holding the owner's PID.
//! A lock whose owner is no longer alive is reclaimed once.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::core::error::{EngineError, EngineResult, IoContext};

/// Held for the engine's lifetime; deletes the lock file on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
        let _ = fs::remove_file(&self.path);
    }
}

impl InstanceLock {
    pub fn acquire(lock_path: &Path) -> EngineResult<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("create lock dir: {}", parent.display()))?;
        }

        match try_create(lock_path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let owner = read_owner(lock_path);
                if let Some(pid) = owner
                    && pid_alive(pid)
                {
                    return Err(EngineError::AlreadyRunning {
                        pid,
                        path: lock_path.to_path_buf(),
                    });
                }

                // Owner is gone (or the file is unreadable); reclaim once.
                tracing::warn!(path = %lock_path.display(), ?owner, "reclaiming stale lock");
                fs::remove_file(lock_path)
                    .io_context(|| format!("remove stale lock: {}", lock_path.display()))?;
                try_create(lock_path).io_context(|| {
                    format!("acquire lock after stale cleanup: {}", lock_path.display())
                })
            }
            Err(e) => Err(EngineError::io(
                format!("acquire lock: {}", lock_path.display()),
                e,
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn try_create(lock_path: &Path) -> io::Result<InstanceLock> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    writeln!(file, "pid={}", std::process::id())?;
    file.sync_all().ok();
    Ok(InstanceLock {
        path: lock_path.to_path_buf(),
        file,
    })
}

fn read_owner(lock_path: &Path) -> Option<u32> {
    let text = fs::read_to_string(lock_path).ok()?;
    text.lines()
        .find_map(|l| l.trim().strip_prefix("pid="))
        .and_then(|p| p.parse().ok())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(pid: u32) -> bool {
    // No cheap liveness probe; only our own PID is known to be stale-free.
    pid == std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_while_held() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("svault.lock");

        let lock = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning { pid, .. } if pid == std::process::id()));

        drop(lock);
        assert!(!path.exists());
        InstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn unreadable_lock_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("svault.lock");
        fs::write(&path, "garbage").unwrap();

        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_owner(lock.path()), Some(std::process::id()));
    }
}
