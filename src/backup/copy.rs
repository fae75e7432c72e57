//! backup/copy: per-file copy worker and the bounded worker pool.
//!
//! Один воркер обрабатывает один файл за раз. Поток-раздатчик кладёт номера заданий в
//! ограниченный канал работ, результаты уходят в ограниченный канал результатов и
//! суммируются в одной точке (координатор).
//!
//! Для файла отношения:
//!   fetch данных и CFM → детектор (b)-(d) → набор изменённых чанков →
//!   запись выбранных чанков подряд (physical_offset пересчитываются) + новый CFM.
//! Инкрементальный бэкап пишет "разреженный" CFM только со скопированными чанками.
//! Если ни один чанк не изменился, файл не пишется (stored = false).

use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use super::CancelToken;
use crate::catalog::{tablespace_dir, BackupContent, ContentEntry, FileKind};
use crate::cfm::{cfm_path, encode_cfm, ChunkDescriptor, CompressedFileMap};
use crate::cmap::TablespaceCompressionMap;
use crate::detect::{check_relation, DetectReport};
use crate::error::{classify, BackupError};
use crate::metrics::record_file_copied;
use crate::tracking::{rel_key, ChangeTrackingProvider, ReferencePoint, RelationView};
use crate::transfer::Transport;
use crate::util::write_file_atomic;

pub(crate) enum JobKind {
    Relation(TablespaceCompressionMap),
    Opaque,
}

pub(crate) struct CopyJob {
    pub tablespace_id: u32,
    /// Source tablespace root.
    pub src_root: PathBuf,
    /// Path relative to the tablespace root.
    pub rel: String,
    pub kind: JobKind,
}

pub(crate) struct CopyContext<'a> {
    pub transport: &'a dyn Transport,
    pub backup_dir: &'a Path,
    /// Some for incremental backups.
    pub tracking: Option<(&'a dyn ChangeTrackingProvider, ReferencePoint)>,
    pub parent: Option<&'a BackupContent>,
    pub fsync: bool,
    pub cancel: &'a CancelToken,
}

pub(crate) struct PoolOutput {
    /// In job order.
    pub entries: Vec<ContentEntry>,
    pub report: DetectReport,
}

/// Findings of the detector (as opposed to IO/transfer/cancel failures).
fn is_finding(err: &anyhow::Error) -> bool {
    match classify(err) {
        Some(e) => e.is_corruption() || matches!(e, BackupError::MissingMetadata { .. }),
        None => false,
    }
}

/// Run all jobs on `workers` threads. Detector findings are collected into the
/// report (stopping at the first one with fail_fast); any other error stops the
/// pool and is returned.
pub(crate) fn run_pool(
    ctx: &CopyContext<'_>,
    jobs: &[CopyJob],
    workers: usize,
    fail_fast: bool,
) -> Result<PoolOutput> {
    let stop = AtomicBool::new(false);
    let mut done: Vec<(usize, ContentEntry)> = Vec::with_capacity(jobs.len());
    let mut report = DetectReport::default();
    let mut fatal: Option<anyhow::Error> = None;

    let workers = workers.max(1).min(jobs.len().max(1));
    // work_cap: запас между раздатчиком и воркерами; result_cap: между воркерами и координатором
    let work_cap = workers * 2;
    let result_cap = workers;

    std::thread::scope(|s| {
        let (work_tx, work_rx) = crossbeam_channel::bounded::<usize>(work_cap);
        let (result_tx, result_rx) =
            crossbeam_channel::bounded::<(usize, Result<ContentEntry>)>(result_cap);
        let stop = &stop;

        s.spawn(move || {
            for i in 0..jobs.len() {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if work_tx.send(i).is_err() {
                    break;
                }
            }
            // work_tx закрывается здесь, воркеры доедают очередь и выходят
        });

        for _ in 0..workers {
            let rx = work_rx.clone();
            let tx = result_tx.clone();
            s.spawn(move || {
                for i in rx {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(job) = jobs.get(i) else { break };
                    let res = ctx.cancel.check().and_then(|_| copy_file(ctx, job));
                    if tx.send((i, res)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        // единственная точка суммирования
        for (i, res) in result_rx {
            match res {
                Ok(entry) => done.push((i, entry)),
                Err(e) if is_finding(&e) => {
                    if report.push(e, fail_fast) {
                        stop.store(true, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    stop.store(true, Ordering::Relaxed);
                    if fatal.is_none() {
                        fatal = Some(e);
                    } else {
                        debug!("copy: further failure after the first: {:#}", e);
                    }
                }
            }
        }
    });

    if let Some(e) = fatal {
        return Err(e);
    }
    done.sort_by_key(|(i, _)| *i);
    report.files_checked += done.len() as u64;
    Ok(PoolOutput {
        entries: done.into_iter().map(|(_, e)| e).collect(),
        report,
    })
}

pub(crate) fn copy_file(ctx: &CopyContext<'_>, job: &CopyJob) -> Result<ContentEntry> {
    match &job.kind {
        JobKind::Relation(map) => copy_relation(ctx, job, map),
        JobKind::Opaque => copy_opaque(ctx, job),
    }
}

fn copy_relation(
    ctx: &CopyContext<'_>,
    job: &CopyJob,
    ts_map: &TablespaceCompressionMap,
) -> Result<ContentEntry> {
    let src = job.src_root.join(&job.rel);
    let data = ctx.transport.fetch(&src)?;
    let cfm_bytes = ctx.transport.fetch(&cfm_path(&src))?;
    let map = check_relation(&src, cfm_bytes.as_deref(), data.as_deref(), ts_map)?;
    let data = data.unwrap_or_default();
    let total = map.chunks.len();

    let known_to_parent = ctx
        .parent
        .map(|p| p.contains(job.tablespace_id, &job.rel, FileKind::Relation))
        .unwrap_or(false);

    let selected: Vec<usize> = match ctx.tracking {
        Some((provider, reference)) if known_to_parent => {
            let key = rel_key(job.tablespace_id, &job.rel);
            let view = RelationView {
                key: &key,
                path: &src,
                map: &map,
                data: &data,
                algorithm: ts_map.algorithm,
            };
            let changed = provider.compute_change_set(&view, &reference)?;
            let chunks = changed.chunks(ts_map.blocks_per_chunk());
            (0..total)
                .filter(|i| chunks.contains(&(map.chunks[*i].logical_offset / map.chunk_size as u64)))
                .collect()
        }
        // FULL, or a relation the parent has never seen
        _ => (0..total).collect(),
    };

    let mut entry = ContentEntry {
        tablespace_id: job.tablespace_id,
        path: job.rel.clone(),
        kind: FileKind::Relation,
        logical_size: map.logical_size,
        chunks_total: total as u64,
        chunks_copied: selected.len() as u64,
        bytes_copied: 0,
        checksum: None,
        stored: true,
    };

    if ctx.tracking.is_some() && known_to_parent && selected.is_empty() {
        entry.stored = false;
        record_file_copied(0, total as u64, 0);
        debug!("copy: {} unchanged, {} chunk(s) skipped", src.display(), total);
        return Ok(entry);
    }

    let dst = tablespace_dir(ctx.backup_dir, job.tablespace_id).join(&job.rel);
    let mut out_map = CompressedFileMap::new(&dst, map.chunk_size);
    out_map.logical_size = map.logical_size;
    out_map.sparse = selected.len() != total;
    let mut out = Vec::with_capacity(selected.iter().map(|i| map.chunks[*i].compressed_length as usize).sum());
    for i in &selected {
        let c = map.chunks[*i];
        let stored = c
            .physical_end()
            .and_then(|end| data.get(c.physical_offset as usize..end as usize))
            .ok_or_else(|| anyhow!("chunk {} of {} out of range after validation", i, src.display()))?;
        out_map.chunks.push(ChunkDescriptor {
            physical_offset: out.len() as u64,
            ..c
        });
        out.extend_from_slice(stored);
    }

    write_file_atomic(&dst, &out, ctx.fsync)?;
    write_file_atomic(&cfm_path(&dst), &encode_cfm(&out_map), ctx.fsync)?;

    entry.bytes_copied = out.len() as u64;
    record_file_copied(selected.len() as u64, (total - selected.len()) as u64, entry.bytes_copied);
    debug!(
        "copy: {} chunks={}/{}, bytes={}",
        src.display(),
        selected.len(),
        total,
        entry.bytes_copied
    );
    Ok(entry)
}

fn copy_opaque(ctx: &CopyContext<'_>, job: &CopyJob) -> Result<ContentEntry> {
    let src = job.src_root.join(&job.rel);
    let data = match ctx.transport.fetch(&src)? {
        Some(d) => d,
        None => {
            warn!("copy: {} vanished during backup", src.display());
            return Err(anyhow!("source file {} vanished during backup", src.display()));
        }
    };
    let dst = tablespace_dir(ctx.backup_dir, job.tablespace_id).join(&job.rel);
    write_file_atomic(&dst, &data, ctx.fsync)?;
    record_file_copied(0, 0, data.len() as u64);
    Ok(ContentEntry {
        tablespace_id: job.tablespace_id,
        path: job.rel.clone(),
        kind: FileKind::Opaque,
        logical_size: data.len() as u64,
        chunks_total: 0,
        chunks_copied: 0,
        bytes_copied: data.len() as u64,
        checksum: Some(crc32c::crc32c(&data)),
        stored: true,
    })
}
