//! instance: the source database instance as seen by the backup engine.
//!
//! Provisioning, SQL and WAL shipping live outside this crate. The engine only
//! needs the operations below: tablespace discovery, backup start/stop LSNs,
//! the archive's last confirmed LSN, an atomic freeze+reset of ptrack bitmaps,
//! and a dedicated connection for STREAM transfers.
//!
//! LocalInstance is the filesystem-backed implementation (and the engine-side
//! write path used by the test-suite).

pub mod local;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::tracking::FrozenTracking;

pub use local::LocalInstance;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablespaceInfo {
    pub id: u32,
    pub name: String,
    /// Absolute path of the tablespace root.
    pub root: PathBuf,
    /// Declared by the instance catalog; a compressed tablespace must carry pg_compression.
    pub compressed: bool,
}

pub trait SourceInstance: Send + Sync {
    fn name(&self) -> &str;

    fn tablespaces(&self) -> Result<Vec<TablespaceInfo>>;

    /// Mark the start of a backup; returns the start LSN.
    fn start_backup(&self) -> Result<u64>;

    /// Mark the end of a backup; returns the stop LSN.
    fn stop_backup(&self) -> Result<u64>;

    /// Last LSN confirmed by the WAL archiver (None if archiving is not configured).
    fn archived_lsn(&self) -> Result<Option<u64>>;

    /// Snapshot all ptrack bitmaps and reset them at `lsn`, atomically with
    /// respect to concurrent writers.
    fn freeze_tracking(&self, lsn: u64) -> Result<FrozenTracking>;

    /// Open a dedicated connection for STREAM transfer.
    fn connect(&self) -> Result<Box<dyn SourceConnection>>;
}

/// A live source-side connection. Loss of the connection surfaces as
/// BackupError::Transfer and is never retried by the engine.
pub trait SourceConnection: Send {
    /// Regular files under `dir`, relative to it and sorted.
    fn list(&mut self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Fetch a file; Ok(None) if the source has no such file.
    fn fetch(&mut self, path: &Path) -> Result<Option<Vec<u8>>>;
}
