//! Centralized configuration for the backup engine.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - BackupConfig::from_env() reads CFS_* variables; fluent with_* setters override them.
//!
//! Defaults:
//! - workers = 4 (copy pool size, one relation file per worker at a time)
//! - fail_fast = true (stop the detector at the first corrupt file)
//! - fsync = false (files are renamed into place without sync_all)
//! - tracking = None (PTRACK uses the bitmap, PAGE uses the block scan)
//! - verify_after_write = true (re-check the written backup tree before finalize)

use std::fmt;

use crate::tracking::ChangeTracking;

#[derive(Clone, Debug)]
pub struct BackupConfig {
    /// Copy worker pool size (min 1).
    /// Env: CFS_BACKUP_WORKERS (default 4)
    pub workers: usize,

    /// Stop checking at the first corrupt file. With false every file is checked
    /// and all findings are logged before the backup fails.
    /// Env: CFS_FAIL_FAST = 0|1 (default 1)
    pub fail_fast: bool,

    /// fsync every written backup file.
    /// Env: CFS_FSYNC = 0|1 (default 0)
    pub fsync: bool,

    /// Override change tracking for incremental backups.
    /// Env: CFS_TRACKING = bitmap|scan (default: derived from the backup type)
    pub tracking: Option<ChangeTracking>,

    /// Run the detector over the written backup tree before the record is finalized.
    /// Env: CFS_VERIFY_AFTER_WRITE = 0|1 (default 1)
    pub verify_after_write: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            fail_fast: true,
            fsync: false,
            tracking: None,
            verify_after_write: true,
        }
    }
}

fn env_flag(v: &str) -> bool {
    let s = v.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "yes" || s == "on"
}

impl BackupConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("CFS_BACKUP_WORKERS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.workers = n.max(1);
            }
        }

        if let Ok(v) = std::env::var("CFS_FAIL_FAST") {
            cfg.fail_fast = env_flag(&v);
        }

        if let Ok(v) = std::env::var("CFS_FSYNC") {
            cfg.fsync = env_flag(&v);
        }

        if let Ok(v) = std::env::var("CFS_TRACKING") {
            cfg.tracking = ChangeTracking::parse(&v);
        }

        if let Ok(v) = std::env::var("CFS_VERIFY_AFTER_WRITE") {
            cfg.verify_after_write = env_flag(&v);
        }

        cfg
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn with_fail_fast(mut self, on: bool) -> Self {
        self.fail_fast = on;
        self
    }

    pub fn with_fsync(mut self, on: bool) -> Self {
        self.fsync = on;
        self
    }

    pub fn with_tracking(mut self, tracking: Option<ChangeTracking>) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn with_verify_after_write(mut self, on: bool) -> Self {
        self.verify_after_write = on;
        self
    }
}

impl fmt::Display for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackupConfig {{ workers: {}, fail_fast: {}, fsync: {}, verify_after_write: {}, tracking: {} }}",
            self.workers,
            self.fail_fast,
            self.fsync,
            self.verify_after_write,
            self.tracking
                .map(|t| t.to_string())
                .unwrap_or_else(|| "default(by type)".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides() {
        let cfg = BackupConfig::default()
            .with_workers(0)
            .with_fail_fast(false)
            .with_tracking(Some(ChangeTracking::Scan));
        assert_eq!(cfg.workers, 1);
        assert!(!cfg.fail_fast);
        assert_eq!(cfg.tracking, Some(ChangeTracking::Scan));
        assert!(cfg.to_string().contains("scan"));
    }
}
