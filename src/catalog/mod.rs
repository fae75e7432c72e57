//! catalog: Backup Catalog, records and backup trees per instance.
//!
//! Раскладка:
//!   <catalog_root>/backups/<instance>/LOCK                  # аренда (fs2), не более одного RUNNING
//!   <catalog_root>/backups/<instance>/<id>/backup.json      # BackupRecord
//!   <catalog_root>/backups/<instance>/<id>/files.json       # BackupContent
//!   <catalog_root>/backups/<instance>/<id>/tablespaces/...  # данные
//!
//! Правила:
//! - id: base36 от unix-секунд; при коллизии берётся last+1, порядок id = порядок создания.
//! - запись создаётся RUNNING и ровно один раз переходит в OK/ERROR/CORRUPT; после этого
//!   не меняется (finalize отказывает).
//! - RUNNING без владельца аренды (процесс умер) закрывается как ERROR при следующем
//!   захвате аренды.
//! - мутации (create/finalize/delete) требуют CatalogLease; чтение без неё.

pub mod content;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::consts::{BACKUPS_DIR, LEASE_FILE, RECORD_FILE};
use crate::error::BackupError;
use crate::lock::{try_acquire_exclusive_lock, LockGuard};
use crate::tracking::ChangeTracking;
use crate::transfer::TransferMode;
use crate::util::{now_unix_ms, write_file_atomic};

pub use content::{
    read_content, tablespace_dir, write_content, BackupContent, ContentEntry, FileKind,
    TablespaceContent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupType {
    Full,
    Page,
    Ptrack,
}

impl BackupType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Some(BackupType::Full),
            "page" => Some(BackupType::Page),
            "ptrack" => Some(BackupType::Ptrack),
            _ => None,
        }
    }

    pub fn is_incremental(self) -> bool {
        !matches!(self, BackupType::Full)
    }

    /// Change tracking used when the configuration does not override it.
    pub fn default_tracking(self) -> Option<ChangeTracking> {
        match self {
            BackupType::Full => None,
            BackupType::Page => Some(ChangeTracking::Scan),
            BackupType::Ptrack => Some(ChangeTracking::Bitmap),
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "FULL"),
            BackupType::Page => write!(f, "PAGE"),
            BackupType::Ptrack => write!(f, "PTRACK"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    Running,
    Ok,
    Error,
    Corrupt,
}

impl BackupStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BackupStatus::Running)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupStatus::Running => write!(f, "RUNNING"),
            BackupStatus::Ok => write!(f, "OK"),
            BackupStatus::Error => write!(f, "ERROR"),
            BackupStatus::Corrupt => write!(f, "CORRUPT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub instance: String,
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub transfer_mode: TransferMode,
    pub status: BackupStatus,
    pub data_bytes: u64,
    /// unix ms
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub start_lsn: Option<u64>,
    pub stop_lsn: Option<u64>,
    pub tracking: Option<ChangeTracking>,
    pub error: Option<String>,
}

/// Exclusive right to run a backup (and mutate records) for one instance.
/// Released on drop.
pub struct CatalogLease {
    instance: String,
    _guard: LockGuard,
}

impl CatalogLease {
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

pub struct BackupCatalog {
    root: PathBuf,
}

impl BackupCatalog {
    /// Open (or create) a catalog rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join(BACKUPS_DIR);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join(BACKUPS_DIR).join(instance)
    }

    pub fn backup_dir(&self, instance: &str, id: &str) -> PathBuf {
        self.instance_dir(instance).join(id)
    }

    /// Take the instance lease. InstanceBusy if another backup holds it.
    pub fn acquire_lease(&self, instance: &str) -> Result<CatalogLease> {
        let dir = self.instance_dir(instance);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let guard = try_acquire_exclusive_lock(&dir.join(LEASE_FILE))?
            .ok_or_else(|| BackupError::InstanceBusy(instance.to_string()))?;
        let lease = CatalogLease {
            instance: instance.to_string(),
            _guard: guard,
        };
        self.close_stale(&lease)?;
        Ok(lease)
    }

    /// Persist a new RUNNING record with a fresh id.
    pub fn create(
        &self,
        lease: &CatalogLease,
        backup_type: BackupType,
        transfer_mode: TransferMode,
    ) -> Result<BackupRecord> {
        let instance = lease.instance();
        let id = self.next_backup_id(instance)?;
        let rec = BackupRecord {
            id,
            instance: instance.to_string(),
            parent_id: None,
            backup_type,
            transfer_mode,
            status: BackupStatus::Running,
            data_bytes: 0,
            started_at: now_unix_ms(),
            finished_at: None,
            start_lsn: None,
            stop_lsn: None,
            tracking: None,
            error: None,
        };
        let dir = self.backup_dir(instance, &rec.id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        save_record(&dir, &rec)?;
        info!(
            "catalog: created backup id={}, instance={}, type={}, mode={}",
            rec.id, instance, backup_type, transfer_mode
        );
        Ok(rec)
    }

    /// Write the terminal state of `rec`. The stored record must still be RUNNING.
    pub fn finalize(&self, lease: &CatalogLease, rec: &mut BackupRecord, status: BackupStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(anyhow!("finalize {} with non-terminal status {}", rec.id, status));
        }
        if rec.instance != lease.instance() {
            return Err(anyhow!(
                "lease for '{}' cannot finalize backup of '{}'",
                lease.instance(),
                rec.instance
            ));
        }
        let stored = self.get(&rec.instance, &rec.id)?;
        if stored.status.is_terminal() {
            return Err(anyhow!(
                "backup {} is already finalized with status {}",
                rec.id,
                stored.status
            ));
        }
        rec.status = status;
        rec.finished_at = Some(now_unix_ms());
        save_record(&self.backup_dir(&rec.instance, &rec.id), rec)?;
        info!(
            "catalog: backup id={} finished status={}, data_bytes={}",
            rec.id, rec.status, rec.data_bytes
        );
        Ok(())
    }

    /// Instances that have a backups directory.
    pub fn instances(&self) -> Result<Vec<String>> {
        let dir = self.root.join(BACKUPS_DIR);
        let mut out = Vec::new();
        for e in fs::read_dir(&dir).with_context(|| format!("read_dir {}", dir.display()))? {
            let e = e?;
            if e.file_type()?.is_dir() {
                out.push(e.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Directories of an instance that hold a record file.
    fn record_dirs(&self, instance: &str) -> Result<Vec<PathBuf>> {
        let dir = self.instance_dir(instance);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for e in fs::read_dir(&dir).with_context(|| format!("read_dir {}", dir.display()))? {
            let p = e?.path();
            if p.join(RECORD_FILE).is_file() {
                out.push(p);
            }
        }
        Ok(out)
    }

    /// All readable records of an instance, ordered by id. A damaged
    /// backup.json is skipped with a warning.
    pub fn list(&self, instance: &str) -> Result<Vec<BackupRecord>> {
        let mut out = Vec::new();
        for p in self.record_dirs(instance)? {
            match load_record(&p) {
                Ok(r) => out.push(r),
                Err(e) => warn!("catalog: skipping unreadable record in {}: {:#}", p.display(), e),
            }
        }
        out.sort_by_key(|r| id_seconds(&r.id).unwrap_or(0));
        Ok(out)
    }

    pub fn get(&self, instance: &str, id: &str) -> Result<BackupRecord> {
        let dir = self.backup_dir(instance, id);
        if !dir.join(RECORD_FILE).is_file() {
            return Err(BackupError::NotFound(format!("backup {} of instance '{}'", id, instance)).into());
        }
        load_record(&dir)
    }

    /// Look a backup id up across all instances.
    pub fn find(&self, id: &str) -> Result<BackupRecord> {
        for inst in self.instances()? {
            if self.backup_dir(&inst, id).join(RECORD_FILE).is_file() {
                return self.get(&inst, id);
            }
        }
        Err(BackupError::NotFound(format!("backup {}", id)).into())
    }

    /// Latest OK backup of the instance (parent for incrementals).
    pub fn latest_ok(&self, instance: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .list(instance)?
            .into_iter()
            .rev()
            .find(|r| r.status == BackupStatus::Ok))
    }

    /// Remove a backup with its tree. Backups that others depend on are kept.
    pub fn delete(&self, lease: &CatalogLease, id: &str) -> Result<BackupRecord> {
        let instance = lease.instance();
        let rec = self.get(instance, id)?;
        if rec.status == BackupStatus::Running {
            return Err(anyhow!("backup {} is still running", id));
        }
        let children: Vec<String> = self
            .list(instance)?
            .into_iter()
            .filter(|r| r.parent_id.as_deref() == Some(id))
            .map(|r| r.id)
            .collect();
        if !children.is_empty() {
            return Err(anyhow!(
                "backup {} is the parent of {}, delete them first",
                id,
                children.join(", ")
            ));
        }
        let dir = self.backup_dir(instance, id);
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        info!("catalog: deleted backup id={}, instance={}", id, instance);
        Ok(rec)
    }

    fn close_stale(&self, lease: &CatalogLease) -> Result<()> {
        for mut rec in self.list(lease.instance())? {
            if rec.status != BackupStatus::Running {
                continue;
            }
            warn!(
                "catalog: backup id={} was left RUNNING without a lease holder, closing as ERROR",
                rec.id
            );
            rec.error = Some("interrupted: backup process exited without finalizing".into());
            self.finalize(lease, &mut rec, BackupStatus::Error)?;
        }
        Ok(())
    }

    fn next_backup_id(&self, instance: &str) -> Result<String> {
        let now = now_unix_ms() / 1000;
        // по именам каталогов: нечитаемые записи тоже занимают id
        let last = self
            .record_dirs(instance)?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).and_then(id_seconds))
            .max();
        let mut secs = match last {
            Some(l) if l >= now => l + 1,
            _ => now,
        };
        while self.backup_dir(instance, &encode_id(secs)).exists() {
            secs += 1;
        }
        Ok(encode_id(secs))
    }
}

/// Uppercase base36.
pub fn encode_id(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

pub fn id_seconds(id: &str) -> Option<u64> {
    u64::from_str_radix(id, 36).ok()
}

fn load_record(dir: &Path) -> Result<BackupRecord> {
    let path = dir.join(RECORD_FILE);
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

fn save_record(dir: &Path, rec: &BackupRecord) -> Result<()> {
    let data = serde_json::to_vec_pretty(rec).context("serialize backup.json")?;
    write_file_atomic(&dir.join(RECORD_FILE), &data, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_base36_and_ordered() {
        assert_eq!(encode_id(0), "0");
        assert_eq!(encode_id(35), "Z");
        assert_eq!(encode_id(36), "10");
        let a = encode_id(1_700_000_000);
        let b = encode_id(1_700_000_001);
        assert_eq!(id_seconds(&a), Some(1_700_000_000));
        assert!(id_seconds(&a) < id_seconds(&b));
    }

    #[test]
    fn type_names_and_default_tracking() {
        assert_eq!(BackupType::parse("ptrack"), Some(BackupType::Ptrack));
        assert_eq!(BackupType::Page.default_tracking(), Some(ChangeTracking::Scan));
        assert_eq!(BackupType::Full.default_tracking(), None);
        assert_eq!(serde_json::to_string(&BackupStatus::Corrupt).unwrap(), "\"CORRUPT\"");
    }
}
