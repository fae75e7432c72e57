//! File-based exclusive locks (fs2 advisory).
//!
//! Used for:
//! - the catalog lease: `backups/<instance>/LOCK`, at most one running backup per instance;
//! - the source instance write lock: `<instance_root>/instance.lock`, serializes engine
//!   writes with tracking freeze.
//!
//! Lock is released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // ошибки unlock при drop игнорируем
        let _ = self.file.unlock();
    }
}

fn open_lock_file(path: &Path) -> Result<std::fs::File> {
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    Ok(f)
}

/// Acquire an exclusive lock. Blocks until acquired.
pub fn acquire_exclusive_lock(path: &Path) -> Result<LockGuard> {
    let file = open_lock_file(path)?;
    file.lock_exclusive()
        .with_context(|| format!("lock_exclusive {}", path.display()))?;
    Ok(LockGuard {
        file,
        path: path.to_path_buf(),
    })
}

/// Try to acquire an exclusive lock. Returns Ok(None) if somebody else holds it.
pub fn try_acquire_exclusive_lock(path: &Path) -> Result<Option<LockGuard>> {
    let file = open_lock_file(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(LockGuard {
            file,
            path: path.to_path_buf(),
        })),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(e) => Err(e).with_context(|| format!("try_lock_exclusive {}", path.display())),
    }
}
