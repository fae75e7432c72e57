//! Backup Orchestrator: FULL / PAGE / PTRACK backups of a CFS instance.
//!
//! Явный автомат состояний:
//!   Init → Discover → Copy → Validate → Finalize → Done
//!   (любая фаза после Init может перейти в Failed)
//!
//! - Init: аренда инстанса (не более одного RUNNING), запись RUNNING с новым id.
//! - Discover: соединение STREAM, родитель (последний OK) для инкрементов, start_backup, заморозка
//!   ptrack (до чтения любого блока), карты сжатия, парность CFM↔данные, задания.
//! - Copy: пул воркеров, детектор до копирования, запись чанков и CFM, карты сжатия,
//!   ptrack-карты (только ARCHIVE), files.json.
//! - Validate: детектор по записанному дереву.
//! - Finalize: stop_backup, архив WAL (ARCHIVE) должен дойти до stop_lsn, data_bytes,
//!   терминальная запись OK.
//! - Failed: находки детектора → CORRUPT, всё остальное (IO, метаданные, транспорт,
//!   отслеживание изменений, отмена) → ERROR. Запись сохраняется всегда.
//!
//! Отмена (CancelToken) проверяется на переходах и перед каждым файлом.

pub mod copy;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::catalog::{
    read_content, tablespace_dir, write_content, BackupCatalog, BackupContent, BackupRecord,
    BackupStatus, BackupType, CatalogLease, ContentEntry, FileKind, TablespaceContent,
};
use crate::cmap::cmap_path;
use crate::config::BackupConfig;
use crate::detect::{check_backup_tree, check_compression_map, pair_relation_files, DetectReport};
use crate::error::{classify, BackupError};
use crate::instance::SourceInstance;
use crate::metrics::{record_backup_finished, record_backup_started};
use crate::tracking::bitmap::{is_ptrack, ptrack_path};
use crate::tracking::{provider_for, ChangeTrackingProvider, FrozenTracking, ReferencePoint};
use crate::transfer::{ArchiveTransport, StreamTransport, TransferMode, Transport};
use crate::util::{is_tmp, rel_string, write_file_atomic};

use copy::{run_pool, CopyContext, CopyJob, JobKind};

/// What to back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupRequest {
    pub backup_type: BackupType,
    pub mode: TransferMode,
}

impl BackupRequest {
    pub fn new(backup_type: BackupType) -> Self {
        Self {
            backup_type,
            mode: TransferMode::Archive,
        }
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Cooperative cancellation flag shared with the running backup.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(BackupError::Cancelled.into());
        }
        Ok(())
    }
}

/// State owned by one backup attempt once its record exists.
struct Attempt {
    lease: CatalogLease,
    record: BackupRecord,
    dir: PathBuf,
    transport: Box<dyn Transport>,
    /// start_backup was called and stop_backup was not.
    in_backup: bool,
}

struct Plan {
    jobs: Vec<CopyJob>,
    tablespaces: Vec<TablespaceContent>,
    /// (tablespace id, pg_compression bytes)
    maps: Vec<(u32, Vec<u8>)>,
    tracking: Option<(Box<dyn ChangeTrackingProvider>, ReferencePoint)>,
    parent: Option<BackupContent>,
    frozen: FrozenTracking,
    report: DetectReport,
}

enum Phase {
    Init,
    Discover(Attempt),
    Copy(Attempt, Plan),
    Validate(Attempt, BackupContent),
    Finalize(Attempt, BackupContent),
    Failed(Attempt, anyhow::Error),
    Done(BackupRecord),
}

pub struct Orchestrator<'a> {
    catalog: &'a BackupCatalog,
    source: &'a dyn SourceInstance,
    cfg: BackupConfig,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(catalog: &'a BackupCatalog, source: &'a dyn SourceInstance, cfg: BackupConfig) -> Self {
        Self {
            catalog,
            source,
            cfg,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one backup attempt to a terminal status. On failure the record is
    /// already persisted (ERROR or CORRUPT) when the error is returned.
    pub fn run(&self, req: &BackupRequest) -> Result<BackupRecord> {
        let mut phase = Phase::Init;
        loop {
            phase = match phase {
                Phase::Init => Phase::Discover(self.init(req)?),
                Phase::Discover(mut att) => match self.discover(&mut att) {
                    Ok(plan) => Phase::Copy(att, plan),
                    Err(e) => Phase::Failed(att, e),
                },
                Phase::Copy(att, plan) => match self.copy(&att, plan) {
                    Ok(content) if self.cfg.verify_after_write => Phase::Validate(att, content),
                    Ok(content) => Phase::Finalize(att, content),
                    Err(e) => Phase::Failed(att, e),
                },
                Phase::Validate(att, content) => match self.validate(&att, &content) {
                    Ok(()) => Phase::Finalize(att, content),
                    Err(e) => Phase::Failed(att, e),
                },
                Phase::Finalize(mut att, content) => match self.finalize(&mut att, &content) {
                    Ok(()) => Phase::Done(att.record),
                    Err(e) => Phase::Failed(att, e),
                },
                Phase::Failed(att, err) => return Err(self.fail(att, err)),
                Phase::Done(record) => {
                    record_backup_finished(true);
                    return Ok(record);
                }
            };
        }
    }

    fn init(&self, req: &BackupRequest) -> Result<Attempt> {
        let instance = self.source.name();
        let lease = self.catalog.acquire_lease(instance)?;
        let record = self.catalog.create(&lease, req.backup_type, req.mode)?;
        record_backup_started();
        info!(
            "backup: start id={}, instance={}, type={}, mode={}, {}",
            record.id, instance, req.backup_type, req.mode, self.cfg
        );
        let dir = self.catalog.backup_dir(instance, &record.id);
        let transport: Box<dyn Transport> = match req.mode {
            TransferMode::Archive => Box::new(ArchiveTransport),
            // соединение откроем в Discover, чтобы отказ попал в запись
            TransferMode::Stream => Box::new(PendingStream),
        };
        Ok(Attempt {
            lease,
            record,
            dir,
            transport,
            in_backup: false,
        })
    }

    fn discover(&self, att: &mut Attempt) -> Result<Plan> {
        self.cancel.check()?;
        let fail_fast = self.cfg.fail_fast;
        let backup_type = att.record.backup_type;

        if att.record.transfer_mode == TransferMode::Stream {
            att.transport = Box::new(StreamTransport::new(self.source.connect()?));
        }

        // родитель и точка отсчёта
        let mut parent = None;
        let mut reference = None;
        if backup_type.is_incremental() {
            let p = self.catalog.latest_ok(&att.record.instance)?.ok_or_else(|| {
                BackupError::NotFound(format!(
                    "no OK backup of instance '{}' to use as parent of a {} backup",
                    att.record.instance, backup_type
                ))
            })?;
            let r = ReferencePoint {
                start_lsn: p.start_lsn.unwrap_or(0),
                stop_lsn: p.stop_lsn.unwrap_or(0),
            };
            att.record.parent_id = Some(p.id.clone());
            parent = Some(read_content(&self.catalog.backup_dir(&p.instance, &p.id))?);
            reference = Some(r);
            debug!("backup: parent id={}, start_lsn={}, stop_lsn={}", p.id, r.start_lsn, r.stop_lsn);
        }
        if let (BackupType::Page, Some(r)) = (backup_type, reference) {
            self.check_archive_covers(r.stop_lsn)?;
        }

        let start_lsn = self.source.start_backup()?;
        att.in_backup = true;
        att.record.start_lsn = Some(start_lsn);
        // до чтения любого блока
        let frozen = self.source.freeze_tracking(start_lsn)?;

        let kind = if backup_type.is_incremental() {
            self.cfg.tracking.or(backup_type.default_tracking())
        } else {
            None
        };
        att.record.tracking = kind;
        let tracking = match (kind, reference) {
            (Some(k), Some(r)) => Some((provider_for(k, frozen.clone(), &r)?, r)),
            _ => None,
        };
        if let Some((p, r)) = &tracking {
            debug!("backup: change tracking {} since start_lsn={}", p.kind(), r.start_lsn);
        }

        let mut plan = Plan {
            jobs: Vec::new(),
            tablespaces: Vec::new(),
            maps: Vec::new(),
            tracking,
            parent,
            frozen,
            report: DetectReport::default(),
        };

        'tablespaces: for ts in self.source.tablespaces()? {
            self.cancel.check()?;
            let listing = att.transport.list(&ts.root)?;
            let mut entry = TablespaceContent {
                id: ts.id,
                name: ts.name.clone(),
                compressed: ts.compressed,
                algorithm: None,
            };
            if ts.compressed {
                let bytes = att.transport.fetch(&cmap_path(&ts.root))?;
                let map = match check_compression_map(ts.id, &ts.root, &listing, bytes.as_deref()) {
                    Ok(m) => m,
                    Err(e) => {
                        // без карты файлы табличного пространства не обработать
                        plan.tablespaces.push(entry);
                        if plan.report.push(e, fail_fast) {
                            break 'tablespaces;
                        }
                        continue;
                    }
                };
                entry.algorithm = Some(map.algorithm.code());
                let (paired, findings) = pair_relation_files(&ts.root, &listing);
                for f in findings {
                    if plan.report.push(f, fail_fast) {
                        plan.tablespaces.push(entry);
                        break 'tablespaces;
                    }
                }
                for rel in paired {
                    plan.jobs.push(CopyJob {
                        tablespace_id: ts.id,
                        src_root: ts.root.clone(),
                        rel,
                        kind: JobKind::Relation(map.clone()),
                    });
                }
                plan.maps.push((ts.id, bytes.unwrap_or_default()));
            } else {
                for rel in listing.iter().filter(|p| !is_tmp(p) && !is_ptrack(p)) {
                    plan.jobs.push(CopyJob {
                        tablespace_id: ts.id,
                        src_root: ts.root.clone(),
                        rel: rel_string(rel),
                        kind: JobKind::Opaque,
                    });
                }
            }
            plan.tablespaces.push(entry);
        }

        if fail_fast && !plan.report.is_clean() {
            std::mem::take(&mut plan.report).into_result()?;
        }
        info!(
            "backup: discovered id={}, tablespaces={}, files={}, start_lsn={}, tracking={}",
            att.record.id,
            plan.tablespaces.len(),
            plan.jobs.len(),
            start_lsn,
            kind.map(|k| k.to_string()).unwrap_or_else(|| "none".into())
        );
        Ok(plan)
    }

    fn copy(&self, att: &Attempt, plan: Plan) -> Result<BackupContent> {
        self.cancel.check()?;
        let fsync = self.cfg.fsync;
        let ctx = CopyContext {
            transport: att.transport.as_ref(),
            backup_dir: &att.dir,
            tracking: plan.tracking.as_ref().map(|(p, r)| (p.as_ref(), *r)),
            parent: plan.parent.as_ref(),
            fsync,
            cancel: &self.cancel,
        };
        let out = run_pool(&ctx, &plan.jobs, self.cfg.workers, self.cfg.fail_fast)?;
        let mut report = plan.report;
        report.merge(out.report);
        report.into_result()?;
        self.cancel.check()?;

        for ts in &plan.tablespaces {
            let d = tablespace_dir(&att.dir, ts.id);
            fs::create_dir_all(&d).with_context(|| format!("create {}", d.display()))?;
        }
        for (id, bytes) in &plan.maps {
            write_file_atomic(&cmap_path(&tablespace_dir(&att.dir, *id)), bytes, fsync)?;
        }

        let mut files = out.entries;
        if att.transport.mode().persists_tracking() && plan.frozen.enabled {
            let mut keys: Vec<&String> = plan.frozen.bitmaps.keys().collect();
            keys.sort();
            for key in keys {
                let Some((ts, rel)) = key.split_once('/').and_then(|(t, r)| Some((t.parse::<u32>().ok()?, r)))
                else {
                    warn!("backup: skip tracking bitmap with bad key {}", key);
                    continue;
                };
                if plan.tablespaces.iter().all(|t| t.id != ts) {
                    continue;
                }
                let bm = &plan.frozen.bitmaps[key];
                let bytes = bm.encode();
                let rel_ptrack = rel_string(&ptrack_path(Path::new(rel)));
                let dst = tablespace_dir(&att.dir, ts).join(&rel_ptrack);
                write_file_atomic(&dst, &bytes, fsync)?;
                files.push(ContentEntry {
                    tablespace_id: ts,
                    path: rel_ptrack,
                    kind: FileKind::Tracking,
                    logical_size: bytes.len() as u64,
                    chunks_total: 0,
                    chunks_copied: 0,
                    bytes_copied: bytes.len() as u64,
                    checksum: None,
                    stored: true,
                });
            }
        }

        let content = BackupContent {
            tablespaces: plan.tablespaces,
            files,
        };
        write_content(&att.dir, &content, fsync)?;
        Ok(content)
    }

    fn validate(&self, att: &Attempt, content: &BackupContent) -> Result<()> {
        self.cancel.check()?;
        check_backup_tree(&att.dir, content, self.cfg.fail_fast).into_result()
    }

    fn finalize(&self, att: &mut Attempt, content: &BackupContent) -> Result<()> {
        self.cancel.check()?;
        let stop_lsn = self.source.stop_backup()?;
        att.in_backup = false;
        att.record.stop_lsn = Some(stop_lsn);
        if att.record.transfer_mode == TransferMode::Archive {
            match self.source.archived_lsn()? {
                Some(a) if a >= stop_lsn => {}
                other => {
                    return Err(BackupError::Transfer(format!(
                        "WAL archive has not reached stop lsn {} (archived: {})",
                        stop_lsn,
                        other.map(|a| a.to_string()).unwrap_or_else(|| "not configured".into())
                    ))
                    .into())
                }
            }
        }
        att.record.data_bytes = content.data_bytes();
        att.record.error = None;
        self.catalog.finalize(&att.lease, &mut att.record, BackupStatus::Ok)
    }

    /// Persist the failed record; returns the error for the caller.
    fn fail(&self, mut att: Attempt, err: anyhow::Error) -> anyhow::Error {
        let status = match classify(&err) {
            Some(e) if e.is_corruption() => BackupStatus::Corrupt,
            _ => BackupStatus::Error,
        };
        error!("backup: id={} failed ({}): {:#}", att.record.id, status, err);
        if att.in_backup {
            match self.source.stop_backup() {
                Ok(lsn) => att.record.stop_lsn = Some(lsn),
                Err(e) => warn!("backup: stop_backup after failure: {:#}", e),
            }
        }
        att.record.error = Some(format!("{:#}", err));
        record_backup_finished(false);
        if let Err(e) = self.catalog.finalize(&att.lease, &mut att.record, status) {
            error!("backup: could not persist failed record id={}: {:#}", att.record.id, e);
        }
        err
    }

    fn check_archive_covers(&self, parent_stop_lsn: u64) -> Result<()> {
        match self.source.archived_lsn()? {
            Some(a) if a >= parent_stop_lsn => Ok(()),
            Some(a) => Err(BackupError::ChangeTrackingUnavailable(format!(
                "WAL archive gap: archived up to lsn {}, parent stop lsn {}",
                a, parent_stop_lsn
            ))
            .into()),
            None => Err(BackupError::ChangeTrackingUnavailable(
                "WAL archiving is not configured on the source instance".into(),
            )
            .into()),
        }
    }
}

/// Placeholder until Discover opens the STREAM connection.
struct PendingStream;

impl Transport for PendingStream {
    fn mode(&self) -> TransferMode {
        TransferMode::Stream
    }

    fn list(&self, _dir: &Path) -> Result<Vec<PathBuf>> {
        Err(BackupError::Transfer("stream connection is not open".into()).into())
    }

    fn fetch(&self, _path: &Path) -> Result<Option<Vec<u8>>> {
        Err(BackupError::Transfer("stream connection is not open".into()).into())
    }
}

/// Run a backup with a fresh cancel token.
pub fn run_backup(
    catalog: &BackupCatalog,
    source: &dyn SourceInstance,
    req: &BackupRequest,
    cfg: &BackupConfig,
) -> Result<BackupRecord> {
    Orchestrator::new(catalog, source, cfg.clone()).run(req)
}
