//! detect: Corruption Detector.
//!
//! Проходы (по порядку, первая ошибка по файлу прекращает проверку этого файла):
//!   (a) карта сжатия: наличие, разбор, единственность в корне табличного пространства;
//!   (b) CFM: наличие и разбор;
//!   (c) парность CFM↔файл данных;
//!   (d) каждый чанк: диапазон, CRC32C, длина после распаковки.
//!
//! Работает дважды: до копирования (байты, полученные из источника через транспорт)
//! и после записи (дерево бэкапа на диске, по списку files.json).
//!
//! Политика fail_fast: остановиться на первой находке, иначе собрать все. В обоих
//! случаях любая находка означает неуспешный бэкап.

use anyhow::{Context, Result};
use log::{debug, error};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::{tablespace_dir, BackupContent, ContentEntry, FileKind};
use crate::cfm::{self, cfm_path, data_path_for, is_cfm, CompressedFileMap};
use crate::cmap::{self, cmap_path, TablespaceCompressionMap};
use crate::consts::CMAP_FILE;
use crate::error::BackupError;
use crate::metrics::{record_chunks_verified, record_corruption_finding};
use crate::tracking::bitmap::is_ptrack;
use crate::tracking::PtrackBitmap;
use crate::util::{is_tmp, rel_string, walk_files};

/// Outcome of a detector run.
#[derive(Debug, Default)]
pub struct DetectReport {
    pub files_checked: u64,
    pub chunks_checked: u64,
    pub findings: Vec<anyhow::Error>,
}

impl DetectReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Record a finding; returns true when the run should stop.
    pub fn push(&mut self, err: anyhow::Error, fail_fast: bool) -> bool {
        error!("detect: {:#}", err);
        record_corruption_finding();
        self.findings.push(err);
        fail_fast
    }

    pub fn merge(&mut self, other: DetectReport) {
        self.files_checked += other.files_checked;
        self.chunks_checked += other.chunks_checked;
        self.findings.extend(other.findings);
    }

    /// Ok if clean, otherwise the first finding (classification is kept).
    pub fn into_result(mut self) -> Result<()> {
        if self.findings.is_empty() {
            return Ok(());
        }
        let n = self.findings.len();
        let first = self.findings.remove(0);
        if n == 1 {
            Err(first)
        } else {
            Err(first.context(format!("{} detector finding(s), first shown", n)))
        }
    }
}

// ---------- pre-copy ----------

/// Pass (a) on a tablespace listing. `bytes` is the fetched pg_compression.
pub fn check_compression_map(
    tablespace_id: u32,
    ts_root: &Path,
    listing: &[PathBuf],
    bytes: Option<&[u8]>,
) -> Result<TablespaceCompressionMap> {
    let path = cmap_path(ts_root);
    let bytes = bytes.ok_or_else(|| BackupError::missing("compression map", &path))?;
    if let Some(nested) = listing
        .iter()
        .find(|p| p.components().count() > 1 && p.file_name().map(|n| n == CMAP_FILE).unwrap_or(false))
    {
        return Err(BackupError::corruption(
            &ts_root.join(nested),
            None,
            "second compression map under the tablespace root",
        )
        .into());
    }
    let map = cmap::decode_compression_map(&path, bytes)?;
    if map.tablespace_id != tablespace_id {
        return Err(BackupError::corruption(
            &path,
            None,
            format!(
                "map belongs to tablespace {}, found under tablespace {}",
                map.tablespace_id, tablespace_id
            ),
        )
        .into());
    }
    Ok(map)
}

/// Pass (c) on a compressed tablespace listing: every data file has a `.cfm`
/// and every `.cfm` has a data file. Returns the paired relation paths.
pub fn pair_relation_files(ts_root: &Path, listing: &[PathBuf]) -> (Vec<String>, Vec<anyhow::Error>) {
    let mut data = BTreeSet::new();
    let mut maps = BTreeSet::new();
    for rel in listing {
        if is_tmp(rel) || is_ptrack(rel) || rel.as_os_str() == CMAP_FILE {
            continue;
        }
        if is_cfm(rel) {
            maps.insert(rel.clone());
        } else {
            data.insert(rel.clone());
        }
    }

    let mut paired = Vec::new();
    let mut findings = Vec::new();
    for rel in &data {
        if maps.contains(&cfm_path(rel)) {
            paired.push(rel_string(rel));
        } else {
            findings.push(
                BackupError::corruption(&ts_root.join(rel), None, "data file has no CFM sidecar").into(),
            );
        }
    }
    for m in &maps {
        let has_data = data_path_for(m).map(|d| data.contains(&d)).unwrap_or(false);
        if !has_data {
            findings.push(
                BackupError::corruption(&ts_root.join(m), None, "CFM sidecar has no data file").into(),
            );
        }
    }
    (paired, findings)
}

/// Passes (b)–(d) for one relation file, on fetched bytes.
pub fn check_relation(
    data_path: &Path,
    cfm_bytes: Option<&[u8]>,
    data: Option<&[u8]>,
    ts_map: &TablespaceCompressionMap,
) -> Result<CompressedFileMap> {
    let cfm_bytes = cfm_bytes.ok_or_else(|| BackupError::missing("CFM", &cfm_path(data_path)))?;
    let map = cfm::decode_cfm(data_path, cfm_bytes)?;
    let data = data.ok_or_else(|| BackupError::corruption(data_path, None, "data file vanished"))?;
    if map.sparse {
        return Err(BackupError::malformed_cfm(&cfm_path(data_path), "sparse map in a live relation").into());
    }
    if map.chunk_size != ts_map.chunk_size {
        return Err(BackupError::malformed_cfm(
            &cfm_path(data_path),
            format!(
                "chunk size {} differs from tablespace chunk size {}",
                map.chunk_size, ts_map.chunk_size
            ),
        )
        .into());
    }
    cfm::validate(&map, ts_map.algorithm, data)?;
    record_chunks_verified(map.chunks.len() as u64);
    Ok(map)
}

// ---------- post-write ----------

/// Re-check a written backup tree against its content list. Needs no source.
pub fn check_backup_tree(backup_dir: &Path, content: &BackupContent, fail_fast: bool) -> DetectReport {
    let mut report = DetectReport::default();

    // (a) карты сжатия
    let mut maps = Vec::new();
    for ts in &content.tablespaces {
        if !ts.compressed {
            continue;
        }
        let ts_dir = tablespace_dir(backup_dir, ts.id);
        report.files_checked += 1;
        match cmap::read_compression_map(&ts_dir) {
            Ok(m) if Some(m.algorithm) != ts.algorithm() => {
                let err = BackupError::corruption(
                    &cmap_path(&ts_dir),
                    None,
                    format!("algorithm {} differs from the recorded one", m.algorithm),
                );
                if report.push(err.into(), fail_fast) {
                    return report;
                }
            }
            Ok(m) => maps.push(m),
            Err(e) => {
                if report.push(e, fail_fast) {
                    return report;
                }
            }
        }
    }

    // (b)-(d) по списку содержимого
    for entry in content.stored() {
        report.files_checked += 1;
        let res = match entry.kind {
            FileKind::Relation => {
                match maps.iter().find(|m| m.tablespace_id == entry.tablespace_id) {
                    Some(m) => check_stored_relation(backup_dir, entry, m).map(|n| {
                        report.chunks_checked += n;
                    }),
                    // карта уже попала в находки
                    None => continue,
                }
            }
            FileKind::Opaque => check_stored_opaque(backup_dir, entry),
            FileKind::Tracking => check_stored_tracking(backup_dir, entry),
        };
        if let Err(e) = res {
            if report.push(e, fail_fast) {
                return report;
            }
        }
    }

    // (c) лишние файлы и осиротевшие CFM
    for ts in &content.tablespaces {
        let ts_dir = tablespace_dir(backup_dir, ts.id);
        if !ts_dir.is_dir() {
            continue;
        }
        let listing = match walk_files(&ts_dir) {
            Ok(l) => l,
            Err(e) => {
                if report.push(e, fail_fast) {
                    return report;
                }
                continue;
            }
        };
        for rel in listing {
            if let Some(err) = unexpected_file(content, ts.id, ts.compressed, &ts_dir, &rel) {
                if report.push(err.into(), fail_fast) {
                    return report;
                }
            }
        }
    }

    record_chunks_verified(report.chunks_checked);
    debug!(
        "detect: {} checked, files={}, chunks={}, findings={}",
        backup_dir.display(),
        report.files_checked,
        report.chunks_checked,
        report.findings.len()
    );
    report
}

fn check_stored_relation(
    backup_dir: &Path,
    entry: &ContentEntry,
    ts_map: &TablespaceCompressionMap,
) -> Result<u64> {
    let path = entry.path_in(backup_dir);
    if !path.is_file() {
        return Err(BackupError::corruption(&path, None, "data file missing from backup").into());
    }
    let map = cfm::read_cfm(&path)?;
    let data = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    if map.logical_size != entry.logical_size {
        return Err(BackupError::corruption(
            &path,
            None,
            format!(
                "CFM logical size {} differs from recorded {}",
                map.logical_size, entry.logical_size
            ),
        )
        .into());
    }
    if map.chunks.len() as u64 != entry.chunks_copied {
        return Err(BackupError::corruption(
            &path,
            None,
            format!(
                "CFM lists {} chunk(s), {} were copied",
                map.chunks.len(),
                entry.chunks_copied
            ),
        )
        .into());
    }
    cfm::validate(&map, ts_map.algorithm, &data)?;
    Ok(map.chunks.len() as u64)
}

fn check_stored_opaque(backup_dir: &Path, entry: &ContentEntry) -> Result<()> {
    let path = entry.path_in(backup_dir);
    if !path.is_file() {
        return Err(BackupError::corruption(&path, None, "file missing from backup").into());
    }
    let data = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let actual = crc32c::crc32c(&data);
    if entry.checksum != Some(actual) || data.len() as u64 != entry.bytes_copied {
        return Err(BackupError::corruption(
            &path,
            None,
            format!(
                "checksum mismatch (recorded {:08x?}, actual {:08x}, {} bytes)",
                entry.checksum,
                actual,
                data.len()
            ),
        )
        .into());
    }
    Ok(())
}

fn check_stored_tracking(backup_dir: &Path, entry: &ContentEntry) -> Result<()> {
    let path = entry.path_in(backup_dir);
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    PtrackBitmap::decode(&path, &bytes)?;
    Ok(())
}

fn unexpected_file(
    content: &BackupContent,
    tablespace_id: u32,
    compressed: bool,
    ts_dir: &Path,
    rel: &Path,
) -> Option<BackupError> {
    let key = rel_string(rel);
    if compressed && key == CMAP_FILE {
        return None;
    }
    let stored = |path: &str, kind: FileKind| {
        content
            .stored()
            .any(|e| e.tablespace_id == tablespace_id && e.path == path && e.kind == kind)
    };
    if is_cfm(rel) {
        let owner = data_path_for(rel).map(|d| rel_string(&d))?;
        if stored(&owner, FileKind::Relation) {
            return None;
        }
        return Some(BackupError::corruption(&ts_dir.join(rel), None, "CFM sidecar has no data file"));
    }
    if stored(&key, FileKind::Relation) || stored(&key, FileKind::Opaque) || stored(&key, FileKind::Tracking) {
        return None;
    }
    Some(BackupError::corruption(
        &ts_dir.join(rel),
        None,
        "file is not listed in the backup content",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Algorithm;
    use crate::error::classify;

    #[test]
    fn pairing_reports_both_directions() {
        let listing: Vec<PathBuf> = ["1", "1.cfm", "2", "3.cfm", "pg_compression", "1_ptrack"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let (paired, findings) = pair_relation_files(Path::new("/ts"), &listing);
        assert_eq!(paired, vec!["1".to_string()]);
        assert_eq!(findings.len(), 2);
        for f in &findings {
            assert!(classify(f).map(|e| e.is_corruption()).unwrap_or(false));
        }
    }

    #[test]
    fn absent_map_is_missing_metadata() {
        let err = check_compression_map(1, Path::new("/ts"), &[], None).unwrap_err();
        assert!(matches!(classify(&err), Some(BackupError::MissingMetadata { .. })));
    }

    #[test]
    fn nested_map_is_corruption() {
        let m = TablespaceCompressionMap::new(7, Algorithm::Zstd, 8192);
        let bytes = cmap::encode_compression_map(&m);
        let listing = vec![PathBuf::from("pg_compression"), PathBuf::from("sub/pg_compression")];
        let err = check_compression_map(7, Path::new("/ts"), &listing, Some(&bytes)).unwrap_err();
        assert!(classify(&err).map(|e| e.is_corruption()).unwrap_or(false));

        let ok = check_compression_map(7, Path::new("/ts"), &listing[..1], Some(&bytes)).unwrap();
        assert_eq!(ok, m);
    }

    #[test]
    fn report_keeps_first_classified_finding() {
        let mut r = DetectReport::default();
        assert!(!r.push(BackupError::corruption(Path::new("/a"), Some(2), "bad").into(), false));
        r.push(BackupError::missing("CFM", Path::new("/b.cfm")).into(), false);
        let err = r.into_result().unwrap_err();
        assert!(matches!(classify(&err), Some(BackupError::Corruption { .. })));
        assert!(format!("{:#}", err).contains("2 detector finding(s)"));
    }
}
